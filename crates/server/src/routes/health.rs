//! Health endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use beacon_digest::scheduler::JobSnapshot;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/digests", get(digest_health))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let change_feed = state.change_feed.as_ref().map(|l| l.is_connected());

    Json(json!({
        "status": "ok",
        "service": "beacon-server",
        "version": env!("CARGO_PKG_VERSION"),
        "change_feed_connected": change_feed,
        "live_connections": state.registry().live_count().await,
    }))
}

async fn digest_health(State(state): State<AppState>) -> Json<Vec<JobSnapshot>> {
    Json(state.digests.snapshot())
}
