//! relay-config - 配置加载库

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

/// 资源获取失败时的处理策略
///
/// - `Mandatory`: 获取失败直接中止启动
/// - `Degradable`: 记录警告，进程在缺少该能力的情况下继续运行
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePolicy {
    Mandatory,
    #[default]
    Degradable,
}

impl ResourcePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourcePolicy::Mandatory => "mandatory",
            ResourcePolicy::Degradable => "degradable",
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 整体关闭预算（HTTP 停止 + 所有 registry）
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            read_timeout_secs: default_read_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// 消息总线（NATS）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_nats_url")]
    pub url: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_reconnect_wait_ms")]
    pub reconnect_wait_ms: u64,
    /// 最大重连次数，-1 表示无限
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: i64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub policy: ResourcePolicy,
    #[serde(default = "default_startup_subject")]
    pub startup_subject: String,
    #[serde(default = "default_message_subject")]
    pub message_subject: String,
}

fn default_true() -> bool {
    true
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_client_name() -> String {
    "relay".to_string()
}

fn default_reconnect_wait_ms() -> u64 {
    2_000
}

fn default_max_reconnects() -> i64 {
    60
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_startup_subject() -> String {
    "service.startup".to_string()
}

fn default_message_subject() -> String {
    "messages.create".to_string()
}

impl MessagingConfig {
    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_nats_url(),
            client_name: default_client_name(),
            reconnect_wait_ms: default_reconnect_wait_ms(),
            max_reconnects: default_max_reconnects(),
            drain_timeout_ms: default_drain_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            policy: ResourcePolicy::Degradable,
            startup_subject: default_startup_subject(),
            message_subject: default_message_subject(),
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_database_url")]
    pub url: Secret<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub policy: ResourcePolicy,
}

fn default_database_url() -> Secret<String> {
    Secret::new(String::new())
}

fn default_max_connections() -> u32 {
    // 根据环境自动调整连接池大小
    match std::env::var("APP_ENV").as_deref() {
        Ok("production") => 50,
        _ => 10,
    }
}

fn default_min_connections() -> u32 {
    2
}

fn default_db_connect_timeout_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_db_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            policy: ResourcePolicy::Degradable,
        }
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// 遥测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_logging_policy")]
    pub logging_policy: ResourcePolicy,
    #[serde(default)]
    pub metrics_enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default)]
    pub metrics_policy: ResourcePolicy,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_logging_policy() -> ResourcePolicy {
    ResourcePolicy::Mandatory
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            logging_policy: default_logging_policy(),
            metrics_enabled: false,
            metrics_addr: default_metrics_addr(),
            metrics_policy: ResourcePolicy::Degradable,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_name: String,
    #[serde(default = "default_app_env")]
    pub app_env: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_app_env() -> String {
    "development".to_string()
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 优先级：环境变量 > `{config_dir}/{APP_ENV}.toml` > `{config_dir}/default.toml`，
    /// 环境变量前缀为 `RELAY_`，嵌套字段用 `__` 分隔，例如 `RELAY_MESSAGING__URL`
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(format!("{}/default.toml", config_dir)))
                .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
                .merge(Env::prefixed("RELAY_").split("__")),
        )
    }

    /// 从任意 figment 提取并校验
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// 启用的子系统必须提供地址
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.messaging.enabled && self.messaging.url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "messaging is enabled but messaging.url is empty".to_string(),
            ));
        }
        if self.database.enabled && self.database.url.expose_secret().trim().is_empty() {
            return Err(ConfigError::Invalid(
                "database is enabled but database.url is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }

    /// 是否为开发环境
    pub fn is_development(&self) -> bool {
        self.app_env == "development"
    }
}
