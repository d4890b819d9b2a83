//! NATS 连接

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_nats::{Client, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use relay_errors::{AppError, AppResult};
use relay_messaging::{
    ConnectOptions, Connection, Connector, Message, MessageStream, Transport, TransportEvent,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 客户端内部只做一次快速重连，之后交给 `ConnectionManager` 的重连循环
const CLIENT_RECONNECTS: usize = 1;

/// 通过 async-nats 建立连接
#[derive(Debug, Clone, Default)]
pub struct NatsConnector;

impl NatsConnector {
    pub fn new() -> Self {
        Self
    }
}

fn map_event(event: Event) -> Option<TransportEvent> {
    match event {
        Event::Disconnected => Some(TransportEvent::Disconnected(
            "disconnected from server".to_string(),
        )),
        Event::Connected => Some(TransportEvent::Reconnected),
        Event::Closed => Some(TransportEvent::Closed),
        Event::ServerError(e) => {
            warn!(error = ?e, "NATS server error");
            None
        }
        Event::ClientError(e) => {
            warn!(error = ?e, "NATS client error");
            None
        }
        other => {
            debug!(event = ?other, "NATS client event");
            None
        }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self, options: &ConnectOptions) -> AppResult<Connection> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let reconnect_wait = options.reconnect_wait;

        let client = async_nats::ConnectOptions::new()
            .name(options.name.clone())
            .connection_timeout(options.connect_timeout)
            .max_reconnects(Some(CLIENT_RECONNECTS))
            .reconnect_delay_callback(move |_| reconnect_wait)
            .event_callback(move |event| {
                let events_tx = events_tx.clone();
                async move {
                    if let Some(event) = map_event(event) {
                        let _ = events_tx.send(event);
                    }
                }
            })
            .connect(options.url.as_str())
            .await
            .map_err(|e| {
                AppError::connection(format!("failed to connect to {}: {}", options.url, e))
            })?;

        Ok(Connection {
            transport: Box::new(NatsTransport::new(client, options.url.clone())),
            events,
        })
    }
}

/// 一个 NATS 客户端连接
pub struct NatsTransport {
    client: Mutex<Option<Client>>,
    url: String,
    closed: CancellationToken,
}

impl NatsTransport {
    pub fn new(client: Client, url: String) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            url,
            closed: CancellationToken::new(),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Option<Client>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> AppResult<Client> {
        self.guard()
            .clone()
            .ok_or_else(|| AppError::not_connected("NATS connection is closed"))
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> AppResult<()> {
        self.client()?
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| AppError::connection(format!("publish to {} failed: {}", subject, e)))
    }

    async fn subscribe(&self, subject: &str) -> AppResult<MessageStream> {
        let subscriber = self
            .client()?
            .subscribe(subject.to_string())
            .await
            .map_err(|e| AppError::connection(format!("subscribe to {} failed: {}", subject, e)))?;

        let stream = subscriber
            .map(|message| Message::new(message.subject.to_string(), message.payload))
            .take_until(self.closed.clone().cancelled_owned());
        Ok(stream.boxed())
    }

    async fn drain(&self) -> AppResult<()> {
        let client = self.client()?;
        client
            .drain()
            .await
            .map_err(|e| AppError::connection(format!("drain failed: {}", e)))
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Some(client) = self.guard().take() {
            debug!(url = %self.url, "Dropping NATS client");
            drop(client);
        }
    }

    fn server_url(&self) -> Option<String> {
        Some(self.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_event() {
        assert_eq!(
            map_event(Event::Disconnected),
            Some(TransportEvent::Disconnected(
                "disconnected from server".to_string()
            ))
        );
        assert_eq!(map_event(Event::Connected), Some(TransportEvent::Reconnected));
        assert_eq!(map_event(Event::Closed), Some(TransportEvent::Closed));
        assert_eq!(map_event(Event::LameDuckMode), None);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_fails() {
        let options = ConnectOptions::new("nats://127.0.0.1:1")
            .with_connect_timeout(std::time::Duration::from_millis(500));

        let result = NatsConnector::new().connect(&options).await;

        assert!(matches!(result, Err(AppError::Connection(_))));
    }
}
