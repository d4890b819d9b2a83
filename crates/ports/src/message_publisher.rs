//! Message Publisher trait 定义

use async_trait::async_trait;
use bytes::Bytes;
use relay_errors::{AppError, AppResult};
use serde::Serialize;

/// 消息发布者 trait
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// 发布原始负载到 subject
    async fn publish(&self, subject: &str, payload: Bytes) -> AppResult<()>;

    /// 发布前检查连接状态（用于健康检查）
    async fn is_ready(&self) -> bool;
}

/// 序列化为 JSON 后发布
pub async fn publish_json<P, E>(publisher: &P, subject: &str, event: &E) -> AppResult<()>
where
    P: MessagePublisher + ?Sized,
    E: Serialize + Sync,
{
    let payload = serde_json::to_vec(event)
        .map_err(|e| AppError::internal(format!("Failed to serialize message: {}", e)))?;
    publisher.publish(subject, Bytes::from(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, Bytes)>>,
    }

    #[async_trait]
    impl MessagePublisher for Recording {
        async fn publish(&self, subject: &str, payload: Bytes) -> AppResult<()> {
            self.sent.lock().unwrap().push((subject.to_string(), payload));
            Ok(())
        }

        async fn is_ready(&self) -> bool {
            true
        }
    }

    #[derive(Serialize)]
    struct Greeting<'a> {
        message: &'a str,
    }

    #[test]
    fn test_publish_json_serializes_event() {
        let publisher = Recording::default();

        tokio_test::assert_ok!(tokio_test::block_on(publish_json(
            &publisher,
            "greetings",
            &Greeting { message: "hi" },
        )));

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "greetings");
        assert_eq!(&sent[0].1[..], br#"{"message":"hi"}"#);
    }

    #[test]
    fn test_publish_json_through_trait_object() {
        let publisher: Box<dyn MessagePublisher> = Box::new(Recording::default());

        tokio_test::assert_ok!(tokio_test::block_on(publish_json(
            publisher.as_ref(),
            "greetings",
            &Greeting { message: "hi" },
        )));
        assert!(tokio_test::block_on(publisher.is_ready()));
    }
}
