//! 消息总线连接管理器
//!
//! 持有唯一的底层连接。状态变更在写锁下串行执行，publish/subscribe/is_connected
//! 只取读锁；断线后由后台任务按策略重连，重连成功时在写锁下替换传输句柄

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use metrics::counter;
use relay_errors::{AppError, AppResult};
use relay_ports::MessagePublisher;
use tokio::sync::{RwLock, watch};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::options::ConnectOptions;
use crate::state::ConnectionState;
use crate::subscription::Subscription;
use crate::transport::{
    Connection, Connector, Message, MessageStream, Transport, TransportEvent, TransportEvents,
};

/// drain 失败或超时后强制关闭的宽限时间
pub const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(2);

struct Slot {
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
}

impl Slot {
    fn transition(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        debug!(from = %self.state, to = %to, "Connection state transition");
        counter!("bus_state_transitions_total", "to" => to.as_str()).increment(1);
        self.state = to;
    }

    fn connected(&self) -> AppResult<&dyn Transport> {
        match (self.state, &self.transport) {
            (ConnectionState::Connected, Some(transport)) => Ok(transport.as_ref()),
            (state, _) => Err(AppError::not_connected(format!("bus client is {}", state))),
        }
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    slot: RwLock<Slot>,
    /// 停止事件监听和重连任务
    watcher: CancellationToken,
    /// 强制关闭时中止所有订阅处理任务
    subscriptions: CancellationToken,
    /// 订阅处理任务，drain 时等待它们结束
    tasks: TaskTracker,
    /// 每次替换传输句柄或关闭时递增，订阅任务据此重新订阅
    generation: watch::Sender<u64>,
    span: Span,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.watcher.cancel();
        self.subscriptions.cancel();
    }
}

/// 消息总线连接管理器
///
/// 克隆开销很小，所有克隆共享同一个连接
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.options.url)
            .field("name", &self.inner.options.name)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// 创建未连接的管理器，日志记录在 `span` 之下
    pub fn new(connector: Arc<dyn Connector>, options: ConnectOptions, span: Span) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                connector,
                options: options.normalized(),
                slot: RwLock::new(Slot {
                    state: ConnectionState::Disconnected,
                    transport: None,
                }),
                watcher: CancellationToken::new(),
                subscriptions: CancellationToken::new(),
                tasks: TaskTracker::new(),
                generation,
                span,
            }),
        }
    }

    /// 创建并立即连接
    pub async fn connect_with(
        connector: Arc<dyn Connector>,
        options: ConnectOptions,
        span: Span,
    ) -> AppResult<Self> {
        let manager = Self::new(connector, options, span);
        manager.connect().await?;
        Ok(manager)
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    /// 单次连接尝试，失败不重试
    ///
    /// 只能在 `Disconnected` 状态下调用
    pub async fn connect(&self) -> AppResult<()> {
        let span = self.inner.span.clone();
        self.inner.connect().instrument(span).await
    }

    /// 发布消息，未连接时立即返回 `NotConnected`
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> AppResult<()> {
        let span = self.inner.span.clone();
        self.inner
            .publish(subject, payload.into())
            .instrument(span)
            .await
    }

    /// 订阅 subject，`handler` 在独立任务中按顺序处理每条消息
    ///
    /// 重连替换传输句柄后会自动在新连接上重新订阅
    pub async fn subscribe<F, Fut>(&self, subject: &str, handler: F) -> AppResult<Subscription>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        let span = self.inner.span.clone();
        Inner::subscribe(&self.inner, subject, handler)
            .instrument(span)
            .await
    }

    /// 优雅关闭
    ///
    /// 在 `drain_timeout` 内 drain 连接并等待处理中的消息完成；drain 出错或超时则强制关闭，
    /// 并返回 `DrainFailed` / `DrainTimeout`。无论哪种结果，返回后状态都是 `Closed`。
    /// 重复调用或从未连接时直接返回 `Ok(())`
    pub async fn close(&self) -> AppResult<()> {
        let span = self.inner.span.clone();
        let drain_timeout = self.inner.options.drain_timeout;
        self.inner.close(drain_timeout).instrument(span).await
    }

    /// 在 `deadline` 之前完成关闭
    ///
    /// drain 时间取 `drain_timeout` 与 `deadline - FORCE_CLOSE_GRACE` 中较早者，
    /// 保证 drain 失败后强制关闭仍在 `deadline` 之内
    pub async fn close_until(&self, deadline: Instant) -> AppResult<()> {
        let span = self.inner.span.clone();
        let available = deadline
            .saturating_duration_since(Instant::now())
            .saturating_sub(FORCE_CLOSE_GRACE);
        let drain_timeout = self.inner.options.drain_timeout.min(available);
        self.inner.close(drain_timeout).instrument(span).await
    }

    /// 是否处于 `Connected` 状态
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.slot.read().await.state
    }
}

#[async_trait]
impl MessagePublisher for ConnectionManager {
    async fn publish(&self, subject: &str, payload: Bytes) -> AppResult<()> {
        ConnectionManager::publish(self, subject, payload).await
    }

    async fn is_ready(&self) -> bool {
        self.is_connected().await
    }
}

impl Inner {
    async fn connect(self: &Arc<Self>) -> AppResult<()> {
        {
            let mut slot = self.slot.write().await;
            match slot.state {
                ConnectionState::Disconnected => slot.transition(ConnectionState::Connecting),
                ConnectionState::Closed => {
                    return Err(AppError::not_connected("bus client has been closed"));
                }
                state => {
                    return Err(AppError::invalid_state(format!(
                        "connect called while {}",
                        state
                    )));
                }
            }
        }

        info!(url = %self.options.url, name = %self.options.name, "Connecting to message bus");
        let result = self.establish().await;

        let mut slot = self.slot.write().await;
        match result {
            Ok(Connection { transport, events }) => {
                if slot.state.is_closed() {
                    drop(slot);
                    transport.close().await;
                    return Err(AppError::not_connected(
                        "bus client was closed while connecting",
                    ));
                }
                let server = transport
                    .server_url()
                    .unwrap_or_else(|| self.options.url.clone());
                slot.transport = Some(transport);
                slot.transition(ConnectionState::Connected);
                drop(slot);

                self.spawn_watcher(events);
                info!(
                    server = %server,
                    name = %self.options.name,
                    drain_timeout = ?self.options.drain_timeout,
                    "Connected to message bus"
                );
                Ok(())
            }
            Err(e) => {
                if slot.state == ConnectionState::Connecting {
                    slot.transition(ConnectionState::Disconnected);
                }
                error!(url = %self.options.url, error = %e, "Failed to connect to message bus");
                Err(e)
            }
        }
    }

    async fn establish(&self) -> AppResult<Connection> {
        establish(self.connector.as_ref(), &self.options).await
    }

    fn spawn_watcher(self: &Arc<Self>, events: TransportEvents) {
        let weak = Arc::downgrade(self);
        let cancel = self.watcher.clone();
        tokio::spawn(watch_events(weak, events, cancel).instrument(self.span.clone()));
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> AppResult<()> {
        let slot = self.slot.read().await;
        let result = match slot.connected() {
            Ok(transport) => transport.publish(subject, payload).await,
            Err(e) => Err(e),
        };
        drop(slot);

        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!("bus_publish_total", "outcome" => outcome).increment(1);
        if let Err(e) = &result {
            debug!(subject, error = %e, "Publish failed");
        }
        result
    }

    async fn subscribe<F, Fut>(
        this: &Arc<Self>,
        subject: &str,
        handler: F,
    ) -> AppResult<Subscription>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        let (stream, generation) = {
            let slot = this.slot.read().await;
            let transport = slot.connected()?;
            let stream = transport.subscribe(subject).await.map_err(|e| {
                AppError::external_service(format!("failed to subscribe to {}: {}", subject, e))
            })?;
            let mut generation = this.generation.subscribe();
            generation.borrow_and_update();
            (stream, generation)
        };

        let token = this.subscriptions.child_token();
        let span = info_span!(parent: &this.span, "subscription", subject = %subject);
        this.tasks.spawn(
            run_subscription(
                Arc::downgrade(this),
                subject.to_string(),
                stream,
                generation,
                token.clone(),
                handler,
            )
            .instrument(span),
        );

        info!(subject, "Subscribed");
        Ok(Subscription::new(subject, token))
    }

    async fn close(&self, drain_timeout: Duration) -> AppResult<()> {
        self.watcher.cancel();

        let (previous, transport) = {
            let mut slot = self.slot.write().await;
            let previous = slot.state;
            if previous.is_closed() {
                debug!("Close called but bus client is already closed");
                return Ok(());
            }
            slot.transition(ConnectionState::Closed);
            (previous, slot.transport.take())
        };
        self.generation.send_modify(|g| *g += 1);
        self.tasks.close();

        let Some(transport) = transport else {
            debug!(state = %previous, "Bus client closed before a connection was established");
            self.subscriptions.cancel();
            return Ok(());
        };

        if previous == ConnectionState::Reconnecting {
            warn!("Closing bus client while it is offline, skipping drain");
            self.force_close(transport).await;
            return Ok(());
        }

        info!(timeout = ?drain_timeout, "Draining message bus connection");
        let drained = timeout(drain_timeout, async {
            transport.drain().await?;
            self.tasks.wait().await;
            Ok::<(), AppError>(())
        })
        .await;

        match drained {
            Ok(Ok(())) => {
                info!("Message bus connection drained successfully");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Message bus drain failed, forcing close");
                self.force_close(transport).await;
                Err(AppError::drain_failed(e.to_string()))
            }
            Err(_) => {
                error!(
                    timeout = ?drain_timeout,
                    "Message bus drain timed out, forcing close"
                );
                self.force_close(transport).await;
                Err(AppError::DrainTimeout(drain_timeout))
            }
        }
    }

    async fn force_close(&self, transport: Box<dyn Transport>) {
        self.subscriptions.cancel();
        if timeout(FORCE_CLOSE_GRACE, transport.close()).await.is_err() {
            error!(grace = ?FORCE_CLOSE_GRACE, "Forced close did not finish in time, dropping transport");
        }
    }

    /// Connected → Reconnecting；其他状态下忽略断线通知
    async fn begin_reconnect(&self, reason: &str) -> bool {
        let mut slot = self.slot.write().await;
        if slot.state != ConnectionState::Connected {
            return false;
        }
        warn!(reason, url = %self.options.url, "Message bus connection lost");
        slot.transition(ConnectionState::Reconnecting);
        true
    }

    /// 传输层自行恢复；返回 false 表示已关闭
    async fn mark_recovered(&self) -> bool {
        let mut slot = self.slot.write().await;
        match slot.state {
            ConnectionState::Closed => false,
            ConnectionState::Reconnecting => {
                slot.transition(ConnectionState::Connected);
                info!("Message bus connection recovered by transport");
                true
            }
            _ => true,
        }
    }

    /// 安装重连得到的新传输句柄；返回 false 表示期间已关闭
    async fn install(&self, transport: Box<dyn Transport>) -> bool {
        let previous = {
            let mut slot = self.slot.write().await;
            if slot.state.is_closed() {
                drop(slot);
                transport.close().await;
                return false;
            }
            let previous = slot.transport.replace(transport);
            slot.transition(ConnectionState::Connected);
            previous
        };
        self.generation.send_modify(|g| *g += 1);

        if let Some(previous) = previous {
            if timeout(FORCE_CLOSE_GRACE, previous.close()).await.is_err() {
                warn!("Closing the replaced transport timed out");
            }
        }
        true
    }
}

async fn establish(connector: &dyn Connector, options: &ConnectOptions) -> AppResult<Connection> {
    match timeout(options.connect_timeout, connector.connect(options)).await {
        Ok(result) => result,
        Err(_) => Err(AppError::connection(format!(
            "connecting to {} timed out after {:?}",
            options.url, options.connect_timeout
        ))),
    }
}

enum ReconnectOutcome {
    /// 新连接已安装
    Replaced(TransportEvents),
    /// 传输层自行恢复
    Recovered,
    /// 达到最大重连次数
    Exhausted,
    /// 管理器已关闭或被释放
    Stopped,
}

async fn watch_events(weak: Weak<Inner>, mut events: TransportEvents, cancel: CancellationToken) {
    let mut events_open = true;

    while events_open {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let reason = match event {
            Some(TransportEvent::Reconnected) => {
                if !inner.mark_recovered().await {
                    return;
                }
                continue;
            }
            Some(TransportEvent::Disconnected(reason)) => reason,
            Some(TransportEvent::Closed) => "transport closed".to_string(),
            None => {
                events_open = false;
                "transport event stream ended".to_string()
            }
        };

        if !inner.begin_reconnect(&reason).await {
            continue;
        }
        drop(inner);

        match reconnect(&weak, &mut events, &mut events_open, &cancel).await {
            ReconnectOutcome::Replaced(next) => {
                events = next;
                events_open = true;
            }
            ReconnectOutcome::Recovered | ReconnectOutcome::Exhausted => {}
            ReconnectOutcome::Stopped => return,
        }
    }
}

async fn reconnect(
    weak: &Weak<Inner>,
    events: &mut TransportEvents,
    events_open: &mut bool,
    cancel: &CancellationToken,
) -> ReconnectOutcome {
    let Some(inner) = weak.upgrade() else {
        return ReconnectOutcome::Stopped;
    };
    let options = inner.options.clone();
    let connector = Arc::clone(&inner.connector);
    drop(inner);

    let mut attempts: u32 = 0;
    loop {
        if !options.max_reconnects.allows(attempts) {
            error!(
                attempts,
                url = %options.url,
                "Reconnect attempts exhausted, bus client stays offline"
            );
            return ReconnectOutcome::Exhausted;
        }

        tokio::select! {
            _ = cancel.cancelled() => return ReconnectOutcome::Stopped,
            _ = sleep(options.reconnect_wait) => {}
            event = events.recv(), if *events_open => {
                match event {
                    Some(TransportEvent::Reconnected) => {
                        let Some(inner) = weak.upgrade() else {
                            return ReconnectOutcome::Stopped;
                        };
                        return if inner.mark_recovered().await {
                            ReconnectOutcome::Recovered
                        } else {
                            ReconnectOutcome::Stopped
                        };
                    }
                    Some(_) => {}
                    None => *events_open = false,
                }
                continue;
            }
        }

        attempts += 1;
        counter!("bus_reconnect_attempts_total").increment(1);
        info!(attempt = attempts, url = %options.url, "Reconnecting to message bus");

        match establish(connector.as_ref(), &options).await {
            Ok(Connection { transport, events }) => {
                let Some(inner) = weak.upgrade() else {
                    transport.close().await;
                    return ReconnectOutcome::Stopped;
                };
                if !inner.install(transport).await {
                    return ReconnectOutcome::Stopped;
                }
                info!(attempts, "Reconnected to message bus");
                return ReconnectOutcome::Replaced(events);
            }
            Err(e) => {
                warn!(attempt = attempts, error = %e, "Reconnect attempt failed");
            }
        }
    }
}

async fn run_subscription<F, Fut>(
    weak: Weak<Inner>,
    subject: String,
    mut stream: MessageStream,
    mut generation: watch::Receiver<u64>,
    token: CancellationToken,
    handler: F,
) where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<()>> + Send + 'static,
{
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            message = stream.next() => message,
        };

        match next {
            Some(message) => {
                if let Err(e) = handler(message).await {
                    warn!(error = %e, "Message handler failed");
                }
            }
            None => match resubscribe(&weak, &subject, &mut generation, &token).await {
                Some(next_stream) => {
                    info!("Subscription re-established on new connection");
                    stream = next_stream;
                }
                None => break,
            },
        }
    }
    debug!("Subscription task finished");
}

/// 等待新的传输句柄并重新订阅；管理器关闭或订阅取消时返回 None
async fn resubscribe(
    weak: &Weak<Inner>,
    subject: &str,
    generation: &mut watch::Receiver<u64>,
    token: &CancellationToken,
) -> Option<MessageStream> {
    let mut pending = generation.has_changed().unwrap_or(false);

    loop {
        {
            let inner = weak.upgrade()?;
            let slot = inner.slot.read().await;
            if slot.state.is_closed() {
                return None;
            }
            if pending {
                if let Ok(transport) = slot.connected() {
                    match transport.subscribe(subject).await {
                        Ok(stream) => return Some(stream),
                        Err(e) => warn!(error = %e, "Failed to re-subscribe"),
                    }
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => return None,
            changed = generation.changed() => {
                changed.ok()?;
                pending = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBus, MemoryConnector};

    fn manager(connector: &MemoryConnector) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(connector.clone()),
            ConnectOptions::new("memory://test")
                .with_reconnect_wait(Duration::from_millis(10))
                .with_drain_timeout(Duration::from_millis(200)),
            Span::none(),
        )
    }

    #[tokio::test]
    async fn test_new_manager_is_disconnected() {
        let connector = MemoryConnector::new(MemoryBus::new());
        let manager = manager(&connector);

        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let connector = MemoryConnector::new(MemoryBus::new());
        let manager = manager(&connector);

        manager.connect().await.unwrap();
        let err = manager.connect().await.unwrap_err();

        assert!(matches!(err, AppError::InvalidState(_)));
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let connector = MemoryConnector::new(MemoryBus::new());
        connector.set_refuse_connections(true);
        let manager = manager(&connector);

        let err = manager.connect().await.unwrap_err();

        assert!(matches!(err, AppError::Connection(_)));
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_connect_after_close_fails_fast() {
        let connector = MemoryConnector::new(MemoryBus::new());
        let manager = manager(&connector);

        manager.close().await.unwrap();
        let err = manager.connect().await.unwrap_err();

        assert!(matches!(err, AppError::NotConnected(_)));
        assert_eq!(connector.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_failed_drain_forces_close() {
        let connector = MemoryConnector::new(MemoryBus::new());
        let manager = manager(&connector);
        manager.connect().await.unwrap();
        connector.set_fail_drain(true);

        let err = manager.close().await.unwrap_err();

        assert!(matches!(err, AppError::DrainFailed(_)));
        assert_eq!(manager.state().await, ConnectionState::Closed);
    }
}
