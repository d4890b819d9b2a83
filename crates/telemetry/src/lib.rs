//! telemetry - 可观测性库
//!
//! 日志订阅器初始化与 Prometheus 导出器。导出器持有自己的后台任务，
//! 由调用方在关闭阶段显式停止

use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use relay_config::LogFormat;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(String),

    #[error("Invalid metrics listen address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Failed to build Prometheus exporter: {0}")]
    Exporter(String),

    #[error("A metrics recorder is already installed")]
    RecorderAlreadyInstalled,
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

/// 初始化 tracing
///
/// `RUST_LOG` 优先于配置的日志级别；全局订阅器只能安装一次，重复调用返回错误
pub fn try_init_tracing(log_level: &str, format: LogFormat) -> Result<(), TelemetryError> {
    let registry = tracing_subscriber::registry().with(env_filter(log_level));

    let result = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };

    result.map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// Prometheus 导出器
///
/// 安装全局 metrics recorder，并在后台任务中提供 HTTP 抓取端点
pub struct MetricsExporter {
    handle: PrometheusHandle,
    addr: SocketAddr,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsExporter {
    /// 启动导出器，必须在 tokio 运行时内调用
    pub fn start(listen_addr: &str) -> Result<Self, TelemetryError> {
        let addr: SocketAddr =
            listen_addr
                .parse()
                .map_err(|e: std::net::AddrParseError| TelemetryError::InvalidAddress {
                    addr: listen_addr.to_string(),
                    reason: e.to_string(),
                })?;

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(addr)
            .build()
            .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
        let handle = recorder.handle();

        metrics::set_global_recorder(recorder)
            .map_err(|_| TelemetryError::RecorderAlreadyInstalled)?;

        let task = tokio::spawn(async move {
            if let Err(e) = exporter.await {
                warn!(error = ?e, "Prometheus exporter stopped with error");
            }
        });

        info!(%addr, "Prometheus exporter listening");

        Ok(Self {
            handle,
            addr,
            task: Mutex::new(Some(task)),
        })
    }

    /// 监听地址
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 获取 Prometheus 格式的 metrics
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// 停止 HTTP 端点（recorder 仍然保留，直到进程退出），重复调用无副作用
    pub async fn shutdown(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };
        task.abort();
        // abort 后 JoinError::Cancelled 是预期结果
        let _ = task.await;
        info!(addr = %self.addr, "Prometheus exporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let err = MetricsExporter::start("not-an-address").err().unwrap();
        assert!(matches!(err, TelemetryError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn test_exporter_start_and_shutdown() {
        let exporter = MetricsExporter::start("127.0.0.1:0").expect("exporter should start");

        metrics::counter!("relay_test_total").increment(1);
        assert!(exporter.render().contains("relay_test_total"));

        exporter.shutdown().await;
        exporter.shutdown().await;
    }
}
