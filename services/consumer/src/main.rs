//! relay-consumer - 订阅消息总线并处理消息

mod consumer;
mod handler;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use relay_adapter_nats::NatsConnector;
use relay_bootstrap::{Lifecycle, RuntimeConfig, load_config, setup_messaging, setup_telemetry};
use relay_errors::AppError;
use relay_messaging::ConnectionManager;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{Span, info, info_span};

const SERVICE_NAME: &str = "consumer";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    messaging: String,
}

async fn health(State(manager): State<ConnectionManager>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        messaging: manager.state().await.to_string(),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&RuntimeConfig::default())?;

    let (_telemetry, telemetry_registry) =
        setup_telemetry(&config.telemetry, Span::none()).await?;

    let span = info_span!("relay", service = SERVICE_NAME, version = VERSION);
    info!(parent: &span, app_name = %config.app_name, "Starting consumer");

    let mut lifecycle = Lifecycle::new(config.server.shutdown_timeout(), span.clone());
    lifecycle.add(telemetry_registry);

    let (manager, mut messaging_registry) = setup_messaging(
        &config.messaging,
        Arc::new(NatsConnector::new()),
        info_span!(parent: &span, "messaging"),
    )
    .await?;
    let manager = manager.ok_or_else(|| {
        AppError::config("consumer requires messaging; set messaging.enabled = true")
    })?;

    let subscriptions = consumer::subscribe_all(
        &manager,
        &mut messaging_registry,
        &config.messaging.message_subject,
        &config.messaging.startup_subject,
    )
    .await?;
    lifecycle.add(messaging_registry);
    info!(parent: &span, subscriptions = subscriptions.len(), "Consumer ready");

    let router = Router::new()
        .route("/health", get(health))
        .with_state(manager);
    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port)).await?;

    lifecycle.serve(listener, router).await?;
    Ok(())
}
