//! HTTP 处理器

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use relay_errors::AppError;
use serde::{Deserialize, Serialize};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::ApiError;
use crate::application::ProducerService;

pub const SERVICE_NAME: &str = "producer";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ProducerService>,
    pub version: String,
}

pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/health", get(health))
        .route("/message/create", post(create_message))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HelloResponse {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

async fn hello(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("x-service", SERVICE_NAME)],
        Json(HelloResponse {
            message: "Hello, World!".to_string(),
            timestamp: Utc::now(),
            version: state.version,
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub messaging: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let messaging = if state.service.is_ready().await {
        "connected"
    } else if state.service.has_publisher() {
        "reconnecting"
    } else {
        "unavailable"
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE_NAME.to_string(),
        timestamp: Utc::now(),
        messaging: messaging.to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CreateMessageResponse {
    pub success: bool,
}

async fn create_message(
    State(state): State<AppState>,
    body: Result<Json<CreateMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateMessageResponse>), ApiError> {
    let Json(request) = body.map_err(|e| {
        warn!(error = %e, "Invalid request body");
        AppError::validation(format!("invalid request body: {}", e.body_text()))
    })?;

    state.service.publish_message(&request.message).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateMessageResponse { success: true }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use bytes::Bytes;
    use mockall::mock;
    use relay_errors::AppResult;
    use relay_ports::MessagePublisher;
    use tower::ServiceExt;

    mock! {
        pub Publisher {}

        #[async_trait]
        impl MessagePublisher for Publisher {
            async fn publish(&self, subject: &str, payload: Bytes) -> AppResult<()>;
            async fn is_ready(&self) -> bool;
        }
    }

    fn app(publisher: Option<MockPublisher>) -> Router {
        let publisher = publisher.map(|p| Arc::new(p) as Arc<dyn MessagePublisher>);
        router(
            AppState {
                service: Arc::new(ProducerService::new(publisher, "messages.create")),
                version: "test".to_string(),
            },
            Duration::from_secs(5),
        )
    }

    fn post_json(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/message/create")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_hello() {
        let response = app(None)
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-service"], "producer");
        let body = json_body(response).await;
        assert_eq!(body["message"], "Hello, World!");
        assert_eq!(body["version"], "test");
    }

    #[tokio::test]
    async fn test_health_reports_messaging_state() {
        let mut publisher = MockPublisher::new();
        publisher.expect_is_ready().returning(|| true);

        let response = app(Some(publisher))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["messaging"], "connected");
    }

    #[tokio::test]
    async fn test_health_without_bus() {
        let response = app(None)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = json_body(response).await;
        assert_eq!(body["messaging"], "unavailable");
    }

    #[tokio::test]
    async fn test_create_message() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_, _| Ok(()));

        let response = app(Some(publisher))
            .oneshot(post_json(r#"{"message":"hello"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["success"], true);
    }

    #[tokio::test]
    async fn test_create_message_rejects_invalid_body() {
        let response = app(None).oneshot(post_json("not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()["content-type"],
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn test_create_message_rejects_empty_message() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();

        let response = app(Some(publisher))
            .oneshot(post_json(r#"{"message":""}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    struct StalledPublisher;

    #[async_trait]
    impl MessagePublisher for StalledPublisher {
        async fn publish(&self, _subject: &str, _payload: Bytes) -> AppResult<()> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }

        async fn is_ready(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_slow_publish_times_out() {
        let app = router(
            AppState {
                service: Arc::new(ProducerService::new(
                    Some(Arc::new(StalledPublisher) as Arc<dyn MessagePublisher>),
                    "messages.create",
                )),
                version: "test".to_string(),
            },
            Duration::from_millis(50),
        );

        let response = app.oneshot(post_json(r#"{"message":"hello"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_create_message_without_bus_is_unavailable() {
        let response = app(None)
            .oneshot(post_json(r#"{"message":"hello"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["status"], 503);
    }
}
