//! Graceful Shutdown

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::histogram;
use relay_errors::{AppError, AppResult, CleanupFailure, ShutdownError};
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

/// 消息总线 registry 的截止时间上限
pub const MESSAGING_CEILING: Duration = Duration::from_secs(10);
/// 存储 registry 的截止时间上限
pub const STORAGE_CEILING: Duration = Duration::from_secs(10);
/// 遥测 registry 的截止时间上限（最后关闭，留出刷新时间）
pub const TELEMETRY_CEILING: Duration = Duration::from_secs(15);

/// Shutdown 控制器
#[derive(Clone)]
pub struct ShutdownController {
    notify: Arc<Notify>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 触发关闭
    pub fn shutdown(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            info!("Triggering shutdown");
        }
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// 等待关闭信号，已触发时立即返回
    pub fn wait(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        })
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

type CleanupFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send>>;
type CleanupFn = Box<dyn FnOnce(Instant) -> CleanupFuture + Send>;

struct Entry {
    name: String,
    cleanup: CleanupFn,
}

/// 某个子系统的关闭回调集合
///
/// 回调按注册顺序的逆序执行，每个回调都受 registry 截止时间约束，
/// 失败不会中断后续回调
pub struct ShutdownRegistry {
    name: String,
    ceiling: Duration,
    entries: Vec<Entry>,
}

impl ShutdownRegistry {
    pub fn new(name: impl Into<String>, ceiling: Duration) -> Self {
        Self {
            name: name.into(),
            ceiling,
            entries: Vec::new(),
        }
    }

    pub fn messaging() -> Self {
        Self::new("messaging", MESSAGING_CEILING)
    }

    pub fn storage() -> Self {
        Self::new("storage", STORAGE_CEILING)
    }

    pub fn telemetry() -> Self {
        Self::new("telemetry", TELEMETRY_CEILING)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 注册关闭回调，参数为本 registry 的截止时间
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, cleanup: F)
    where
        F: FnOnce(Instant) -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(registry = %self.name, cleanup = %name, "Registered shutdown callback");
        self.entries.push(Entry {
            name,
            cleanup: Box::new(move |deadline| Box::pin(cleanup(deadline)) as CleanupFuture),
        });
    }

    /// 逆序执行所有回调
    ///
    /// 实际截止时间为 `min(deadline, now + ceiling)`；超时的回调记为 `AppError::Timeout`。
    /// 回调只执行一次，再次调用时 registry 为空，直接返回 Ok
    pub async fn cleanup(&mut self, deadline: Instant) -> Result<(), ShutdownError> {
        let deadline = deadline.min(Instant::now() + self.ceiling);
        let entries = std::mem::take(&mut self.entries);
        let mut errors = ShutdownError::new();

        for (index, entry) in entries.into_iter().enumerate().rev() {
            let Entry { name, cleanup } = entry;
            let started = Instant::now();

            let result = match timeout_at(deadline, cleanup(deadline)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::timeout(format!(
                    "cleanup '{}' did not finish before the {} deadline",
                    name, self.name
                ))),
            };
            histogram!("shutdown_cleanup_duration_ms", "registry" => self.name.clone())
                .record(started.elapsed().as_secs_f64() * 1000.0);

            match result {
                Ok(()) => debug!(registry = %self.name, cleanup = %name, "Cleanup finished"),
                Err(e) => {
                    warn!(registry = %self.name, cleanup = %name, error = %e, "Cleanup failed");
                    errors.push(CleanupFailure {
                        registry: self.name.clone(),
                        index,
                        name,
                        source: e,
                    });
                }
            }
        }

        errors.into_result()
    }
}

impl std::fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownRegistry")
            .field("name", &self.name)
            .field("ceiling", &self.ceiling)
            .field("entries", &self.entries.len())
            .finish()
    }
}
