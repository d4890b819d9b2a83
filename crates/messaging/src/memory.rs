//! 进程内总线
//!
//! 同一个 `MemoryBus` 上的所有连接互相可见，按 subject 精确匹配投递。
//! `MemoryConnector` 提供故障注入开关，用于模拟断线、拒绝连接和 drain 异常

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use relay_errors::{AppError, AppResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::options::ConnectOptions;
use crate::transport::{Connection, Connector, Message, MessageStream, Transport, TransportEvent};

struct Subscriber {
    transport_id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct BusInner {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

/// 进程内消息总线
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 投递给 subject 的所有订阅者，返回送达数量
    fn deliver(&self, message: Message) -> usize {
        let mut subscribers = self.subscribers();
        let Some(list) = subscribers.get_mut(&message.subject) else {
            return 0;
        };
        list.retain(|s| !s.sender.is_closed());
        list.iter()
            .filter(|s| s.sender.send(message.clone()).is_ok())
            .count()
    }

    fn add(&self, subject: &str, transport_id: u64, sender: mpsc::UnboundedSender<Message>) {
        self.subscribers()
            .entry(subject.to_string())
            .or_default()
            .push(Subscriber {
                transport_id,
                sender,
            });
    }

    /// 移除某个连接的全部订阅，已缓冲的消息仍可被读完
    fn remove_transport(&self, transport_id: u64) {
        let mut subscribers = self.subscribers();
        for list in subscribers.values_mut() {
            list.retain(|s| s.transport_id != transport_id);
        }
        subscribers.retain(|_, list| !list.is_empty());
    }

    /// subject 当前的订阅者数量
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subscribers()
            .get(subject)
            .map(|list| list.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct Faults {
    refuse_connections: AtomicBool,
    fail_drain: AtomicBool,
    drain_delay_ms: AtomicU64,
    connect_attempts: AtomicU32,
}

struct TransportShared {
    online: AtomicBool,
    closed: CancellationToken,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// 连接到 `MemoryBus` 的 `Connector`
#[derive(Clone)]
pub struct MemoryConnector {
    bus: MemoryBus,
    faults: Arc<Faults>,
    live: Arc<Mutex<Vec<Arc<TransportShared>>>>,
}

impl MemoryConnector {
    pub fn new(bus: MemoryBus) -> Self {
        Self {
            bus,
            faults: Arc::new(Faults::default()),
            live: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    /// 拒绝后续的连接尝试
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.faults
            .refuse_connections
            .store(refuse, Ordering::SeqCst);
    }

    /// drain 直接返回错误
    pub fn set_fail_drain(&self, fail: bool) {
        self.faults.fail_drain.store(fail, Ordering::SeqCst);
    }

    /// drain 开始前等待的时间
    pub fn set_drain_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.faults.drain_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// 连接尝试次数（包括失败的）
    pub fn connect_attempts(&self) -> u32 {
        self.faults.connect_attempts.load(Ordering::SeqCst)
    }

    fn live(&self) -> MutexGuard<'_, Vec<Arc<TransportShared>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 让所有存活的连接断线；订阅保留，恢复后继续收消息
    pub fn disconnect_all(&self, reason: &str) {
        let mut live = self.live();
        live.retain(|t| !t.closed.is_cancelled());
        for transport in live.iter() {
            transport.online.store(false, Ordering::SeqCst);
            let _ = transport
                .events
                .send(TransportEvent::Disconnected(reason.to_string()));
        }
    }

    /// 让断线的连接自行恢复
    pub fn recover_all(&self) {
        let mut live = self.live();
        live.retain(|t| !t.closed.is_cancelled());
        for transport in live.iter() {
            if !transport.online.swap(true, Ordering::SeqCst) {
                let _ = transport.events.send(TransportEvent::Reconnected);
            }
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, options: &ConnectOptions) -> AppResult<Connection> {
        self.faults.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.faults.refuse_connections.load(Ordering::SeqCst) {
            return Err(AppError::connection(format!(
                "connection to {} refused",
                options.url
            )));
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(TransportShared {
            online: AtomicBool::new(true),
            closed: CancellationToken::new(),
            events: events_tx,
        });
        self.live().push(Arc::clone(&shared));

        let transport = MemoryTransport {
            id: self.bus.next_id(),
            url: options.url.clone(),
            bus: self.bus.clone(),
            faults: Arc::clone(&self.faults),
            shared,
            draining: AtomicBool::new(false),
        };
        debug!(id = transport.id, url = %options.url, "Memory transport connected");

        Ok(Connection {
            transport: Box::new(transport),
            events,
        })
    }
}

/// `MemoryBus` 上的一个连接
pub struct MemoryTransport {
    id: u64,
    url: String,
    bus: MemoryBus,
    faults: Arc<Faults>,
    shared: Arc<TransportShared>,
    draining: AtomicBool,
}

impl MemoryTransport {
    fn ensure_usable(&self) -> AppResult<()> {
        if self.shared.closed.is_cancelled() || self.draining.load(Ordering::SeqCst) {
            return Err(AppError::not_connected("memory transport is closed"));
        }
        if !self.shared.online.load(Ordering::SeqCst) {
            return Err(AppError::connection("memory transport is offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> AppResult<()> {
        self.ensure_usable()?;
        let delivered = self.bus.deliver(Message::new(subject, payload));
        debug!(subject, delivered, "Memory publish");
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> AppResult<MessageStream> {
        self.ensure_usable()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.bus.add(subject, self.id, sender);

        let closed = self.shared.closed.clone();
        let stream = futures::stream::unfold((receiver, closed), |(mut receiver, closed)| async move {
            tokio::select! {
                biased;
                _ = closed.cancelled() => None,
                message = receiver.recv() => message.map(|m| (m, (receiver, closed))),
            }
        });
        Ok(stream.boxed())
    }

    async fn drain(&self) -> AppResult<()> {
        if self.faults.fail_drain.load(Ordering::SeqCst) {
            return Err(AppError::connection("drain rejected by memory transport"));
        }
        let delay = self.faults.drain_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.draining.store(true, Ordering::SeqCst);
        self.bus.remove_transport(self.id);
        Ok(())
    }

    async fn close(&self) {
        self.shared.closed.cancel();
        self.bus.remove_transport(self.id);
        let _ = self.shared.events.send(TransportEvent::Closed);
    }

    fn server_url(&self) -> Option<String> {
        Some(self.url.clone())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shared.closed.cancel();
        self.bus.remove_transport(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(connector: &MemoryConnector) -> Connection {
        connector
            .connect(&ConnectOptions::new("memory://test"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_on_same_bus() {
        let connector = MemoryConnector::new(MemoryBus::new());
        let a = connect(&connector).await;
        let b = connect(&connector).await;

        let mut stream = b.transport.subscribe("orders").await.unwrap();
        a.transport
            .publish("orders", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let message = stream.next().await.unwrap();
        assert_eq!(message, Message::new("orders", "hello"));
    }

    #[tokio::test]
    async fn test_refused_connection_counts_attempt() {
        let connector = MemoryConnector::new(MemoryBus::new());
        connector.set_refuse_connections(true);

        let result = connector.connect(&ConnectOptions::default()).await;

        assert!(matches!(result, Err(AppError::Connection(_))));
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_drain_ends_stream_after_buffered_messages() {
        let connector = MemoryConnector::new(MemoryBus::new());
        let conn = connect(&connector).await;
        let mut stream = conn.transport.subscribe("jobs").await.unwrap();

        conn.transport.publish("jobs", Bytes::from_static(b"1")).await.unwrap();
        conn.transport.drain().await.unwrap();

        assert_eq!(stream.next().await.unwrap().payload, Bytes::from_static(b"1"));
        assert!(stream.next().await.is_none());
        assert_eq!(connector.bus().subscriber_count("jobs"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_and_recover_emit_events() {
        let connector = MemoryConnector::new(MemoryBus::new());
        let mut conn = connect(&connector).await;

        connector.disconnect_all("network down");
        let err = conn
            .transport
            .publish("a", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Connection(_)));
        assert_eq!(
            conn.events.recv().await,
            Some(TransportEvent::Disconnected("network down".to_string()))
        );

        connector.recover_all();
        assert_eq!(conn.events.recv().await, Some(TransportEvent::Reconnected));
        conn.transport.publish("a", Bytes::new()).await.unwrap();
    }
}
