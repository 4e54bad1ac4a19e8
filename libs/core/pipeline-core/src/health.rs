//! Three-tier HTTP health surface.
//!
//! Grounded on `stream_worker::health` (`HealthState`, `health_handler`,
//! `ready_handler`, axum `Router` builders), generalized from a
//! single-dependency (Redis-only) readiness probe to an
//! `{orchestrator, consumer, publisher, store}` four-way breakdown, split
//! into three response tiers instead of two.

use crate::broker::BrokerClient;
use crate::metrics;
use crate::shutdown::ShutdownManager;
use crate::store::StoreClient;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct HealthState {
    pub broker: BrokerClient,
    pub store: StoreClient,
    pub shutdown: ShutdownManager,
}

impl HealthState {
    pub fn new(broker: BrokerClient, store: StoreClient, shutdown: ShutdownManager) -> Self {
        Self {
            broker,
            store,
            shutdown,
        }
    }
}

/// `/health/startup` — always 200 while the process is alive. Exists so
/// dependent containers can start even while broker/store are still
/// unavailable.
pub async fn startup_handler() -> Json<Value> {
    Json(json!({ "status": "running" }))
}

/// `/health` — the operator/load-balancer probe. Status code must reflect
/// truth: 200 only when every dependency the worker actually holds (store,
/// broker as both publisher and consumer) is genuinely responding, not
/// merely holding a handle.
pub async fn deep_health_handler(
    State(state): State<HealthState>,
) -> (StatusCode, Json<Value>) {
    let store = state.store.clone();
    let broker = state.broker.clone();

    let checks: Vec<Pin<Box<dyn Future<Output = bool> + Send>>> = vec![
        Box::pin(async move { store.ensure_connected().await && store.is_healthy().await }),
        Box::pin(async move { broker.is_healthy().await }),
    ];
    let results = join_all(checks).await;
    let store_connected = results[0];
    let publisher_connected = results[1];
    let consumer_connected = publisher_connected;
    let orchestrator_connected = !state.shutdown.is_shutdown_requested();

    let all_healthy =
        store_connected && publisher_connected && consumer_connected && orchestrator_connected;

    let body = json!({
        "status": if all_healthy { "healthy" } else { "unhealthy" },
        "checks": {
            "orchestrator": orchestrator_connected,
            "consumer": consumer_connected,
            "publisher": publisher_connected,
            "store": store_connected,
        },
        "details": {
            "store_connected": store_connected,
            "publisher_connected": publisher_connected,
            "consumer_connected": consumer_connected,
        }
    });

    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(body))
}

/// `/health/simple` — legacy probe with a minimal body, same status-code
/// semantics as `/health`.
pub async fn simple_health_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let healthy = state.store.is_healthy().await && state.broker.is_healthy().await;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "status": if healthy { "ok" } else { "unhealthy" } })))
}

/// Prometheus scrape endpoint. Not part of spec.md's contract table, but
/// every health router in this style of service ships it alongside the
/// readiness endpoints.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health/startup", get(startup_handler))
        .route("/health", get(deep_health_handler))
        .route("/health/simple", get(simple_health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TtlPolicy;
    use std::time::Duration;

    fn fresh_state() -> HealthState {
        let broker = BrokerClient::new("amqp://127.0.0.1:5672/%2f");
        let store = StoreClient::new(
            "redis://127.0.0.1:6379",
            TtlPolicy {
                completed_secs: 1,
                failed_secs: 1,
                active_secs: 0,
            },
            Duration::from_secs(30),
            crate::retry::BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(5), 1),
        );
        let shutdown = ShutdownManager::new(Duration::from_secs(30)).unwrap();
        HealthState::new(broker, store, shutdown)
    }

    #[tokio::test]
    async fn startup_handler_always_reports_running() {
        let Json(body) = startup_handler().await;
        assert_eq!(body["status"], "running");
    }

    #[tokio::test]
    async fn simple_health_is_unhealthy_before_any_connection() {
        let state = fresh_state();
        let (status, _) = simple_health_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_handler_reports_unavailable_before_init() {
        use axum::body::to_bytes;

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8(body.to_vec()).unwrap().contains("not initialized"));
    }
}
