//! relay-errors - 统一错误处理
//!
//! 基于 RFC 7807 Problem Details 规范，另外提供关闭阶段的聚合错误

mod shutdown;

pub use shutdown::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 初次连接失败（不重试）
    #[error("Connection error: {0}")]
    Connection(String),

    /// 连接不处于 Connected 状态时调用 publish/subscribe
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// drain 超时，已强制关闭
    #[error("Drain timed out after {0:?}, connection was force-closed")]
    DrainTimeout(std::time::Duration),

    /// drain 报错，已强制关闭
    #[error("Drain failed, connection was force-closed: {0}")]
    DrainFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// 状态机不允许的调用
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("External service error: {0}")]
    ExternalService(String),
}

impl AppError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::NotConnected(msg.into())
    }

    pub fn drain_failed(msg: impl Into<String>) -> Self {
        Self::DrainFailed(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn telemetry(msg: impl Into<String>) -> Self {
        Self::Telemetry(msg.into())
    }

    pub fn external_service(msg: impl Into<String>) -> Self {
        Self::ExternalService(msg.into())
    }

    /// 是否为超时类错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::DrainTimeout(_))
    }

    /// 转换为 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::InvalidState(_) => 409,
            Self::Connection(_) | Self::NotConnected(_) => 503,
            Self::Timeout(_) | Self::DrainTimeout(_) => 504,
            Self::ExternalService(_) => 502,
            Self::DrainFailed(_)
            | Self::Config(_)
            | Self::Internal(_)
            | Self::Database(_)
            | Self::Telemetry(_) => 500,
        }
    }

    /// 转换为 Problem Details
    pub fn to_problem_details(&self) -> ProblemDetails {
        ProblemDetails {
            r#type: format!("https://relay.dev/problems/{}", self.problem_slug()),
            title: self.problem_title().to_string(),
            status: self.status_code(),
            detail: self.to_string(),
            instance: None,
        }
    }

    fn problem_slug(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::NotConnected(_) => "not-connected",
            Self::DrainTimeout(_) => "drain-timeout",
            Self::DrainFailed(_) => "drain-failed",
            Self::Timeout(_) => "timeout",
            Self::InvalidState(_) => "invalid-state",
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::Internal(_) => "internal",
            Self::Database(_) => "database",
            Self::Telemetry(_) => "telemetry",
            Self::ExternalService(_) => "external-service",
        }
    }

    fn problem_title(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection Error",
            Self::NotConnected(_) => "Service Unavailable",
            Self::DrainTimeout(_) | Self::Timeout(_) => "Timeout",
            Self::DrainFailed(_) => "Drain Failed",
            Self::InvalidState(_) => "Invalid State",
            Self::Config(_) => "Configuration Error",
            Self::Validation(_) => "Validation Error",
            Self::Internal(_) => "Internal Server Error",
            Self::Database(_) => "Database Error",
            Self::Telemetry(_) => "Telemetry Error",
            Self::ExternalService(_) => "External Service Error",
        }
    }
}

/// RFC 7807 Problem Details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// Result 类型别名
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::not_connected("bus").status_code(), 503);
        assert_eq!(AppError::validation("empty").status_code(), 400);
        assert_eq!(AppError::timeout("cleanup").status_code(), 504);
        assert_eq!(AppError::drain_failed("io").status_code(), 500);
    }

    #[test]
    fn test_problem_details_serialization() {
        let details = AppError::not_connected("NATS client is not connected").to_problem_details();
        let json = serde_json::to_value(&details).unwrap();

        assert_eq!(json["status"], 503);
        assert_eq!(json["type"], "https://relay.dev/problems/not-connected");
        assert!(json.get("instance").is_none());
    }

    #[test]
    fn test_is_timeout() {
        assert!(AppError::DrainTimeout(std::time::Duration::from_secs(1)).is_timeout());
        assert!(AppError::timeout("x").is_timeout());
        assert!(!AppError::connection("x").is_timeout());
    }
}
