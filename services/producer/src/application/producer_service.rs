//! 消息生产服务

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_errors::{AppError, AppResult};
use relay_ports::{MessagePublisher, publish_json};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// 发布到消息 subject 的负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    pub message: String,
}

/// 服务启动通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupMessage {
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

/// 消息生产服务
///
/// 只依赖 `MessagePublisher` 端口；总线不可用时 publisher 为 None
pub struct ProducerService {
    publisher: Option<Arc<dyn MessagePublisher>>,
    message_subject: String,
}

impl ProducerService {
    pub fn new(publisher: Option<Arc<dyn MessagePublisher>>, message_subject: impl Into<String>) -> Self {
        Self {
            publisher,
            message_subject: message_subject.into(),
        }
    }

    fn publisher(&self) -> AppResult<&dyn MessagePublisher> {
        self.publisher
            .as_deref()
            .ok_or_else(|| AppError::not_connected("message publishing not available"))
    }

    pub fn has_publisher(&self) -> bool {
        self.publisher.is_some()
    }

    /// 总线是否可用
    pub async fn is_ready(&self) -> bool {
        match &self.publisher {
            Some(publisher) => publisher.is_ready().await,
            None => false,
        }
    }

    /// 发布一条用户消息
    pub async fn publish_message(&self, message: &str) -> AppResult<()> {
        if message.trim().is_empty() {
            return Err(AppError::validation("message cannot be empty"));
        }
        let publisher = self.publisher()?;

        let data = MessageData {
            message: message.to_string(),
        };
        if let Err(e) = publish_json(publisher, &self.message_subject, &data).await {
            error!(subject = %self.message_subject, error = %e, "Failed to publish message");
            return Err(e);
        }

        info!(subject = %self.message_subject, content = message, "Message published");
        Ok(())
    }

    /// 发布启动通知
    pub async fn publish_startup_message(
        &self,
        service: &str,
        version: &str,
        subject: &str,
    ) -> AppResult<()> {
        let publisher = self.publisher()?;

        let startup = StartupMessage {
            service: service.to_string(),
            version: version.to_string(),
            timestamp: Utc::now(),
            status: "started".to_string(),
        };
        publish_json(publisher, subject, &startup).await?;

        info!(subject, service, version, "Startup message published");
        Ok(())
    }
}
