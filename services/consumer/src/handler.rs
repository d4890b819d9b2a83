//! 消息处理

use metrics::counter;
use relay_errors::{AppError, AppResult};
use relay_messaging::Message;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

/// 消息 subject 上的负载
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageData {
    pub message: String,
}

/// 处理用户消息
pub fn handle_message(message: &Message) -> AppResult<MessageData> {
    let result = serde_json::from_slice::<MessageData>(&message.payload)
        .map_err(|e| AppError::validation(format!("malformed message on {}: {}", message.subject, e)));

    let outcome = if result.is_ok() { "ok" } else { "invalid" };
    counter!("consumer_messages_total", "subject" => message.subject.clone(), "outcome" => outcome)
        .increment(1);

    let data = result?;
    info!(subject = %message.subject, content = %data.message, "Message received");
    Ok(data)
}

/// 处理服务启动通知，只记录日志
pub fn handle_startup(message: &Message) -> AppResult<Value> {
    let value: Value = serde_json::from_slice(&message.payload).map_err(|e| {
        AppError::validation(format!("malformed startup notice on {}: {}", message.subject, e))
    })?;

    info!(
        subject = %message.subject,
        service = value["service"].as_str().unwrap_or("unknown"),
        version = value["version"].as_str().unwrap_or("unknown"),
        "Service started"
    );
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_message_decodes_payload() {
        let message = Message::new("messages.create", r#"{"message":"hi"}"#);

        let data = handle_message(&message).unwrap();

        assert_eq!(data.message, "hi");
    }

    #[test]
    fn test_handle_message_rejects_malformed_payload() {
        let message = Message::new("messages.create", "nope");

        let err = handle_message(&message).unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_handle_startup() {
        let message = Message::new(
            "service.startup",
            r#"{"service":"producer","version":"0.1.0","status":"started","timestamp":"2025-01-01T00:00:00Z"}"#,
        );

        let value = handle_startup(&message).unwrap();

        assert_eq!(value["status"], "started");
    }
}
