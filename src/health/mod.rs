//! Health check endpoints

use crate::metrics::GatewayMetrics;
use crate::nats::NatsPublisher;
use crate::ratelimit::RateLimiter;
use crate::shard::{ShardState, ShardSummary};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub pool_id: u32,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub pool_id: u32,
    pub shards_total: usize,
    pub shards_ready: usize,
    pub shards_dead: usize,
    pub nats_connected: bool,
    pub guilds_total: u64,
    pub events_total: u64,
    pub rate_limited_buckets: usize,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub shard_state: ShardState,
    pub nats: Option<Arc<NatsPublisher>>,
    pub limiter: RateLimiter,
    pub metrics: Arc<GatewayMetrics>,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/shards", get(shards_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        pool_id: state.shard_state.pool_id(),
    })
}

/// Readiness endpoint - returns 200 if at least one shard is ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let shards_ready = state.shard_state.ready_shards();
    let nats_connected = state.nats.as_ref().map_or(true, |n| n.is_connected());

    let is_ready = shards_ready > 0 && nats_connected;

    let response = ReadyResponse {
        ready: is_ready,
        pool_id: state.shard_state.pool_id(),
        shards_total: state.shard_state.shard_count(),
        shards_ready,
        shards_dead: state.shard_state.dead_shards(),
        nats_connected,
        guilds_total: state.shard_state.total_guilds(),
        events_total: state.shard_state.total_events_received(),
        rate_limited_buckets: state.limiter.active_buckets(),
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn shards_handler(State(state): State<AppState>) -> Json<Vec<ShardSummary>> {
    Json(state.shard_state.snapshot())
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.set_shards_ready(
        state.shard_state.pool_id(),
        state.shard_state.ready_shards(),
    );

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
