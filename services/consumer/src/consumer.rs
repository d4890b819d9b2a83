//! 订阅装配

use relay_bootstrap::ShutdownRegistry;
use relay_errors::{AppError, AppResult};
use relay_messaging::{ConnectionManager, ConnectionState, Subscription};
use tracing::info;

use crate::handler::{handle_message, handle_startup};

/// 订阅消息和启动通知，并把取消订阅登记到 messaging registry
///
/// 登记在连接关闭回调之后，因此关闭时先于连接 drain 执行
pub async fn subscribe_all(
    manager: &ConnectionManager,
    registry: &mut ShutdownRegistry,
    message_subject: &str,
    startup_subject: &str,
) -> AppResult<Vec<Subscription>> {
    let messages = manager
        .subscribe(message_subject, |message| async move {
            handle_message(&message).map(|_| ())
        })
        .await?;
    let startups = manager
        .subscribe(startup_subject, |message| async move {
            handle_startup(&message).map(|_| ())
        })
        .await?;

    let subscriptions = vec![messages, startups];
    let registered = subscriptions.clone();
    let connection = manager.clone();
    registry.register("subscriptions", move |_deadline| async move {
        let state = connection.state().await;
        for subscription in &registered {
            subscription.unsubscribe();
        }
        info!(count = registered.len(), %state, "Subscriptions cancelled");

        // 取消订阅必须早于连接 drain
        if state == ConnectionState::Closed {
            return Err(AppError::invalid_state(
                "subscriptions cancelled after the bus connection was closed",
            ));
        }
        Ok(())
    });

    Ok(subscriptions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use relay_bootstrap::setup_messaging;
    use relay_config::MessagingConfig;
    use relay_messaging::ConnectOptions;
    use relay_messaging::memory::{MemoryBus, MemoryConnector};
    use tokio::time::Instant;
    use tracing::Span;

    #[tokio::test]
    async fn test_subscription_cleanup_runs_before_connection_close() {
        let bus = MemoryBus::new();
        let config = MessagingConfig {
            url: "memory://test".to_string(),
            ..Default::default()
        };
        let (manager, mut registry) = setup_messaging(
            &config,
            Arc::new(MemoryConnector::new(bus.clone())),
            Span::none(),
        )
        .await
        .unwrap();
        let manager = manager.unwrap();

        let subscriptions =
            subscribe_all(&manager, &mut registry, "messages.create", "service.startup")
                .await
                .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(bus.subscriber_count("messages.create"), 1);

        // 订阅回调观察到的连接仍是 Connected 时才返回 Ok
        registry
            .cleanup(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();

        assert!(subscriptions.iter().all(|s| !s.is_active()));
        assert_eq!(manager.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_subscription_cleanup_after_close_is_reported() {
        let bus = MemoryBus::new();
        let manager = ConnectionManager::connect_with(
            Arc::new(MemoryConnector::new(bus)),
            ConnectOptions::new("memory://test"),
            Span::none(),
        )
        .await
        .unwrap();
        let mut registry = ShutdownRegistry::messaging();

        subscribe_all(&manager, &mut registry, "messages.create", "service.startup")
            .await
            .unwrap();
        let connection = manager.clone();
        registry.register("messaging", move |_| async move { connection.close().await });

        let err = registry
            .cleanup(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err.len(), 1);
        assert_eq!(err.failures()[0].name, "subscriptions");
        assert!(matches!(err.failures()[0].source, AppError::InvalidState(_)));
    }
}
