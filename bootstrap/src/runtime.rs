//! 服务运行时

use relay_config::{AppConfig, ConfigError};
use tracing::info;

/// 服务运行时配置
pub struct RuntimeConfig {
    pub config_dir: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            config_dir: "config".to_string(),
        }
    }
}

/// 加载 `.env`（如果存在）后读取配置
///
/// 此时日志尚未初始化，`.env` 缺失不视为错误
pub fn load_config(runtime: &RuntimeConfig) -> Result<AppConfig, ConfigError> {
    dotenvy::dotenv().ok();
    AppConfig::load(&runtime.config_dir)
}

/// 等待关闭信号（SIGINT / SIGTERM）
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
