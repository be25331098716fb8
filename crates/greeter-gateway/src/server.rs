//! HTTP server implementation using Axum.

use axum::{Router, routing::get};
use greeter_core::config::GatewayConfig;
use greeter_scheduler::{CircuitBreaker, JobQueue, MessageDb};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MessageDb>,
    pub queue: Arc<dyn JobQueue>,
    /// Breaker guarding the active sender.
    pub breaker: Arc<CircuitBreaker>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(store: Arc<MessageDb>, queue: Arc<dyn JobQueue>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            store,
            queue,
            breaker,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/api/v1/info", get(super::routes::system_info))
        .route("/api/v1/scheduler/stats", get(super::routes::scheduler_stats))
        .route("/api/v1/messages/stats", get(super::routes::message_stats))
        .route("/api/v1/messages/{key}", get(super::routes::message_by_key))
        .route("/api/v1/users/{id}/messages", get(super::routes::user_messages))
        .route("/api/v1/queue/stats", get(super::routes::queue_stats))
        .route("/api/v1/queue/dead-letters", get(super::routes::dead_letters))
        .layer(
            CorsLayer::new()
                .allow_methods([axum::http::Method::GET])
                .allow_headers(Any)
                .allow_origin(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve until `shutdown` flips to true.
pub async fn start(
    config: &GatewayConfig,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    tracing::info!("🌐 Gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use greeter_core::config::BreakerConfig;
    use greeter_core::traits::SystemClock;
    use greeter_scheduler::SqliteJobQueue;
    use tower::ServiceExt;

    fn state() -> AppState {
        let clock = Arc::new(SystemClock);
        AppState::new(
            Arc::new(MessageDb::open_in_memory().unwrap()),
            Arc::new(SqliteJobQueue::open_in_memory(clock.clone(), chrono::Duration::minutes(5)).unwrap()),
            Arc::new(CircuitBreaker::new(
                "http",
                &BreakerConfig::default(),
                std::time::Duration::from_secs(10),
                clock,
            )),
        )
    }

    async fn get_json(path: &str) -> (StatusCode, serde_json::Value) {
        let resp = build_router(state())
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_health_route() {
        let (status, json) = get_json("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_scheduler_stats_route() {
        let (status, json) = get_json("/api/v1/scheduler/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["schedulers"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (status, _) = get_json("/api/v1/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
