//! relay-producer - 通过 HTTP 接收消息并发布到消息总线

mod api;
mod application;

use std::sync::Arc;
use std::time::Duration;

use relay_adapter_nats::NatsConnector;
use relay_bootstrap::{
    Lifecycle, RuntimeConfig, load_config, setup_messaging, setup_storage, setup_telemetry,
};
use relay_ports::MessagePublisher;
use tokio::net::TcpListener;
use tracing::{Span, info, info_span, warn};

use api::{AppState, SERVICE_NAME};
use application::ProducerService;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 启动通知延迟发送，等连接稳定
const STARTUP_MESSAGE_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&RuntimeConfig::default())?;

    // 1. 遥测（日志订阅器在这里安装）
    let (telemetry, telemetry_registry) =
        setup_telemetry(&config.telemetry, Span::none()).await?;

    let span = info_span!("relay", service = SERVICE_NAME, version = VERSION);
    info!(
        parent: &span,
        app_name = %config.app_name,
        app_env = %config.app_env,
        metrics = telemetry.metrics.is_some(),
        "Starting producer"
    );

    let mut lifecycle = Lifecycle::new(config.server.shutdown_timeout(), span.clone());
    lifecycle.add(telemetry_registry);

    // 2. 存储
    let (_pool, storage_registry) =
        setup_storage(&config.database, info_span!(parent: &span, "storage")).await?;
    lifecycle.add(storage_registry);

    // 3. 消息总线
    let (manager, messaging_registry) = setup_messaging(
        &config.messaging,
        Arc::new(NatsConnector::new()),
        info_span!(parent: &span, "messaging"),
    )
    .await?;
    lifecycle.add(messaging_registry);

    let publisher = manager.map(|m| Arc::new(m) as Arc<dyn MessagePublisher>);
    let service = Arc::new(ProducerService::new(
        publisher,
        config.messaging.message_subject.clone(),
    ));

    if service.has_publisher() {
        let service = Arc::clone(&service);
        let subject = config.messaging.startup_subject.clone();
        let controller = lifecycle.controller();
        tokio::spawn(async move {
            tokio::select! {
                _ = controller.wait() => return,
                _ = tokio::time::sleep(STARTUP_MESSAGE_DELAY) => {}
            }
            if let Err(e) = service
                .publish_startup_message(SERVICE_NAME, VERSION, &subject)
                .await
            {
                warn!(error = %e, "Failed to publish startup message");
            }
        });
    } else {
        warn!(parent: &span, "Message bus unavailable, message publishing is disabled");
    }

    let router = api::router(
        AppState {
            service,
            version: VERSION.to_string(),
        },
        config.server.read_timeout(),
    );
    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port)).await?;

    lifecycle.serve(listener, router).await?;
    Ok(())
}
