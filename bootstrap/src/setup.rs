//! 子系统初始化
//!
//! 每个子系统的初始化返回资源句柄和它自己的 `ShutdownRegistry`。
//! 获取失败时按 `ResourcePolicy` 决定中止启动还是降级运行

use std::future::Future;
use std::sync::Arc;

use relay_adapter_postgres::{PostgresConfig, check_connection, close_pool, create_pool};
use relay_config::{DatabaseConfig, MessagingConfig, TelemetryConfig};
pub use relay_config::ResourcePolicy;
use relay_errors::{AppError, AppResult};
use relay_messaging::{ConnectOptions, ConnectionManager, Connector, ReconnectLimit};
use relay_telemetry::{MetricsExporter, try_init_tracing};
use sqlx::PgPool;
use tokio::time::Instant;
use tracing::{Instrument, Span, error, info, warn};

use crate::shutdown::ShutdownRegistry;

/// 描述一个可选资源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub name: &'static str,
    pub enabled: bool,
    pub policy: ResourcePolicy,
}

impl ResourceDescriptor {
    pub fn new(name: &'static str, enabled: bool, policy: ResourcePolicy) -> Self {
        Self {
            name,
            enabled,
            policy,
        }
    }
}

fn on_failure<T>(descriptor: &ResourceDescriptor, err: AppError) -> AppResult<Option<T>> {
    match descriptor.policy {
        ResourcePolicy::Mandatory => {
            error!(resource = descriptor.name, error = %err, "Failed to acquire mandatory resource");
            Err(err)
        }
        ResourcePolicy::Degradable => {
            warn!(
                resource = descriptor.name,
                error = %err,
                "Failed to acquire resource, continuing without it"
            );
            Ok(None)
        }
    }
}

/// 获取资源并注册关闭回调
///
/// - 未启用：`Ok(None)`，不注册任何回调
/// - 获取成功：先注册 `cleanup_fn`，再返回 `Ok(Some(handle))`
/// - 获取失败：`Mandatory` 返回错误，`Degradable` 记录警告并返回 `Ok(None)`
pub async fn acquire<T, A, AFut, C, CFut>(
    descriptor: &ResourceDescriptor,
    registry: &mut ShutdownRegistry,
    acquire_fn: A,
    cleanup_fn: C,
) -> AppResult<Option<T>>
where
    T: Clone + Send + 'static,
    A: FnOnce() -> AFut,
    AFut: Future<Output = AppResult<T>>,
    C: FnOnce(T, Instant) -> CFut + Send + 'static,
    CFut: Future<Output = AppResult<()>> + Send + 'static,
{
    if !descriptor.enabled {
        info!(resource = descriptor.name, "Resource disabled, skipping");
        return Ok(None);
    }

    match acquire_fn().await {
        Ok(handle) => {
            let registered = handle.clone();
            registry.register(descriptor.name, move |deadline| {
                cleanup_fn(registered, deadline)
            });
            info!(
                resource = descriptor.name,
                policy = descriptor.policy.as_str(),
                "Resource acquired"
            );
            Ok(Some(handle))
        }
        Err(e) => on_failure(descriptor, e),
    }
}

/// 从配置构造连接选项
pub fn connect_options(config: &MessagingConfig) -> ConnectOptions {
    ConnectOptions::new(config.url.clone())
        .with_name(config.client_name.clone())
        .with_reconnect_wait(config.reconnect_wait())
        .with_max_reconnects(ReconnectLimit::from_sentinel(config.max_reconnects))
        .with_drain_timeout(config.drain_timeout())
        .with_connect_timeout(config.connect_timeout())
}

/// 初始化消息总线连接，关闭回调为 `ConnectionManager::close_until`
pub async fn setup_messaging(
    config: &MessagingConfig,
    connector: Arc<dyn Connector>,
    span: Span,
) -> AppResult<(Option<ConnectionManager>, ShutdownRegistry)> {
    let mut registry = ShutdownRegistry::messaging();
    let descriptor = ResourceDescriptor::new("messaging", config.enabled, config.policy);
    let options = connect_options(config);
    let manager_span = span.clone();

    let manager = acquire(
        &descriptor,
        &mut registry,
        move || ConnectionManager::connect_with(connector, options, manager_span),
        |manager: ConnectionManager, deadline| async move { manager.close_until(deadline).await },
    )
    .instrument(span)
    .await?;

    Ok((manager, registry))
}

/// 初始化数据库连接池，关闭回调为 `PgPool::close`
pub async fn setup_storage(
    config: &DatabaseConfig,
    span: Span,
) -> AppResult<(Option<PgPool>, ShutdownRegistry)> {
    let mut registry = ShutdownRegistry::storage();
    let descriptor = ResourceDescriptor::new("storage", config.enabled, config.policy);
    let pg_config = PostgresConfig::from(config);

    let pool = acquire(
        &descriptor,
        &mut registry,
        || async move {
            let pool = create_pool(&pg_config).await?;
            check_connection(&pool).await?;
            Ok(pool)
        },
        |pool: PgPool, _deadline| async move {
            close_pool(&pool).await;
            Ok(())
        },
    )
    .instrument(span)
    .await?;

    Ok((pool, registry))
}

/// 遥测初始化结果
#[derive(Clone, Default)]
pub struct Telemetry {
    /// 日志订阅器是否由本次初始化安装
    pub logging: bool,
    pub metrics: Option<Arc<MetricsExporter>>,
}

/// 初始化日志和 Prometheus 导出器
///
/// 日志订阅器没有需要关闭的资源，导出器的关闭回调停止其 HTTP 任务
pub async fn setup_telemetry(
    config: &TelemetryConfig,
    span: Span,
) -> AppResult<(Telemetry, ShutdownRegistry)> {
    let mut registry = ShutdownRegistry::telemetry();

    let logging = ResourceDescriptor::new("logging", true, config.logging_policy);
    let logging = match try_init_tracing(&config.log_level, config.log_format) {
        Ok(()) => true,
        Err(e) => on_failure::<()>(&logging, AppError::telemetry(e.to_string()))?.is_some(),
    };

    let descriptor =
        ResourceDescriptor::new("metrics", config.metrics_enabled, config.metrics_policy);
    let addr = config.metrics_addr.clone();
    let metrics = acquire(
        &descriptor,
        &mut registry,
        || async move {
            MetricsExporter::start(&addr)
                .map(Arc::new)
                .map_err(|e| AppError::telemetry(e.to_string()))
        },
        |exporter: Arc<MetricsExporter>, _deadline| async move {
            exporter.shutdown().await;
            Ok(())
        },
    )
    .instrument(span)
    .await?;

    Ok((Telemetry { logging, metrics }, registry))
}
