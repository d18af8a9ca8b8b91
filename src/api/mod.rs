//! Status HTTP listener.
//!
//! A read-only view of the control loop: liveness plus the latest tick
//! snapshot. The listener only ever reads the watch channel; it never
//! touches controller state.

mod routes;
pub mod state;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use self::state::AppState;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    routes::api_routes()
        .fallback(fallback)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}

/// Bind and serve the status listener until the process exits.
pub async fn serve(bind: SocketAddr, state: AppState) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind status listener on {}", bind))?;
    info!(%bind, "status listener ready");
    axum::serve(listener, app).await?;
    Ok(())
}
