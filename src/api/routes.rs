//! API route definitions.

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use super::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339()
        }
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.status.borrow().clone();
    Json(json!({
        "data": snapshot,
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339()
        }
    }))
}
