//! 应用生命周期
//!
//! 按初始化顺序收集各子系统的 `ShutdownRegistry`，服务直到收到关闭信号，
//! 然后先停止 HTTP 服务，再按初始化的逆序执行所有 registry

use std::time::Duration;

use axum::Router;
use relay_errors::ShutdownError;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, Span, error, info, warn};

use crate::runtime::shutdown_signal;
use crate::shutdown::{ShutdownController, ShutdownRegistry};

/// 整体关闭预算的默认值
pub const DEFAULT_SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("HTTP server error: {0}")]
    Server(#[from] std::io::Error),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

pub struct Lifecycle {
    registries: Vec<ShutdownRegistry>,
    budget: Duration,
    controller: ShutdownController,
    span: Span,
}

impl Lifecycle {
    pub fn new(budget: Duration, span: Span) -> Self {
        Self {
            registries: Vec::new(),
            budget,
            controller: ShutdownController::new(),
            span,
        }
    }

    /// 按初始化顺序添加
    pub fn add(&mut self, registry: ShutdownRegistry) {
        info!(
            parent: &self.span,
            registry = registry.name(),
            callbacks = registry.len(),
            ceiling = ?registry.ceiling(),
            "Shutdown registry attached"
        );
        self.registries.push(registry);
    }

    /// 用于在进程内部触发关闭
    pub fn controller(&self) -> ShutdownController {
        self.controller.clone()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// 服务 HTTP 请求直到收到 SIGINT/SIGTERM 或控制器触发，然后执行关闭流程
    ///
    /// 服务器本身的错误优先返回；否则返回关闭阶段的聚合错误
    pub async fn serve(mut self, listener: TcpListener, router: Router) -> Result<(), LifecycleError> {
        let span = self.span.clone();
        async move {
            let addr = listener.local_addr()?;
            info!(%addr, "HTTP server listening");

            let controller = self.controller.clone();
            let mut server = tokio::spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move { controller.wait().await })
                    .await
            });

            let finished = tokio::select! {
                result = &mut server => Some(result),
                _ = shutdown_signal() => None,
                _ = self.controller.wait() => None,
            };
            self.controller.shutdown();

            let budget = self.budget();
            let deadline = Instant::now() + budget;
            info!(?budget, "Shutting down");

            let finished = match finished {
                Some(result) => Some(result),
                None => timeout_at(deadline, server).await.ok(),
            };
            let server_error = match finished {
                Some(Ok(Ok(()))) => {
                    info!("HTTP server stopped");
                    None
                }
                Some(Ok(Err(e))) => {
                    error!(error = %e, "HTTP server failed");
                    Some(e)
                }
                Some(Err(e)) => {
                    error!(error = %e, "HTTP server task panicked");
                    None
                }
                None => {
                    warn!("HTTP server did not stop before the shutdown deadline");
                    None
                }
            };

            let result = self.shutdown(deadline).await;
            match server_error {
                Some(e) => Err(LifecycleError::Server(e)),
                None => result.map_err(LifecycleError::from),
            }
        }
        .instrument(span)
        .await
    }

    /// 按初始化的逆序执行所有 registry，合并失败记录
    pub async fn shutdown(&mut self, deadline: Instant) -> Result<(), ShutdownError> {
        let span = self.span.clone();
        let registries = &mut self.registries;
        async move {
            let mut errors = ShutdownError::new();
            for registry in registries.iter_mut().rev() {
                info!(
                    registry = registry.name(),
                    callbacks = registry.len(),
                    "Running shutdown registry"
                );
                if let Err(e) = registry.cleanup(deadline).await {
                    errors.merge(e);
                }
            }

            match errors.into_result() {
                Ok(()) => {
                    info!("Shutdown complete");
                    Ok(())
                }
                Err(e) => {
                    for failure in e.failures() {
                        error!(
                            registry = %failure.registry,
                            cleanup = %failure.name,
                            error = %failure.source,
                            "Shutdown step failed"
                        );
                    }
                    error!(failures = e.len(), "Shutdown completed with errors");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::routing::get;
    use relay_errors::AppError;

    fn registry(name: &'static str, order: &Arc<Mutex<Vec<String>>>, fail: bool) -> ShutdownRegistry {
        let mut registry = ShutdownRegistry::new(name, Duration::from_secs(5));
        for step in ["first", "second"] {
            let order = Arc::clone(order);
            registry.register(step, move |_| async move {
                order.lock().unwrap().push(format!("{}.{}", name, step));
                if fail && step == "first" {
                    Err(AppError::internal(format!("{} failed", name)))
                } else {
                    Ok(())
                }
            });
        }
        registry
    }

    #[tokio::test]
    async fn test_shutdown_runs_registries_in_reverse_setup_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = Lifecycle::new(DEFAULT_SHUTDOWN_BUDGET, Span::none());
        assert_eq!(lifecycle.budget(), Duration::from_secs(30));
        lifecycle.add(registry("telemetry", &order, false));
        lifecycle.add(registry("storage", &order, false));
        lifecycle.add(registry("messaging", &order, false));

        lifecycle
            .shutdown(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec![
                "messaging.second",
                "messaging.first",
                "storage.second",
                "storage.first",
                "telemetry.second",
                "telemetry.first",
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_merges_failures_and_keeps_going() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = Lifecycle::new(DEFAULT_SHUTDOWN_BUDGET, Span::none());
        lifecycle.add(registry("storage", &order, true));
        lifecycle.add(registry("messaging", &order, true));

        let err = lifecycle
            .shutdown(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(order.lock().unwrap().len(), 4);
        let registries: Vec<_> = err.failures().iter().map(|f| f.registry.as_str()).collect();
        assert_eq!(registries, vec!["messaging", "storage"]);
    }

    #[tokio::test]
    async fn test_serve_stops_on_controller_trigger() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = Lifecycle::new(Duration::from_secs(5), Span::none());
        lifecycle.add(registry("messaging", &order, false));
        let controller = lifecycle.controller();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router = Router::new().route("/health", get(|| async { "ok" }));
        let handle = tokio::spawn(lifecycle.serve(listener, router));

        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(order.lock().unwrap().len(), 2);
    }
}
