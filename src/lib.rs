//! Pauser -- playback-aware pause/resume controller for Tdarr transcode nodes.
//!
//! Polls Jellyfin for active video playback and pauses Tdarr's transcode
//! workers while anyone is watching, resuming them when playback stops.
//! Optional daily schedule windows can force either state; when a window and
//! playback disagree, pause wins.

pub mod api;
pub mod config;
pub mod controller;
pub mod engine;
pub mod jellyfin;
pub mod schedule;
pub mod tdarr;

use anyhow::Result;
use tracing::{debug, error, warn};

use crate::config::PauserConfig;

/// Start the pauser daemon: control loop plus optional status listener.
/// Returns after a signal-driven shutdown.
pub async fn serve(config: PauserConfig) -> Result<()> {
    let activity = jellyfin::JellyfinClient::new(
        &config.jellyfin_url,
        config.jellyfin_api_key.clone(),
        config.call_timeout,
    )?;
    let target = tdarr::TdarrClient::new(&config.tdarr_url, config.call_timeout)?;
    let retry = controller::RetryPolicy {
        limit: config.retry_limit,
        base: config.retry_base,
    };
    let controller = controller::Controller::new(target, retry, config.cancel_workers);
    let (engine, status_rx) = engine::Engine::new(
        activity,
        controller,
        config.schedule.clone(),
        config.poll_interval,
    );

    if let Some(bind) = config.status_bind {
        let state = api::state::AppState { status: status_rx };
        tokio::spawn(async move {
            if let Err(e) = api::serve(bind, state).await {
                error!(error = %e, "status listener failed");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    engine.run(shutdown_rx).await;
    Ok(())
}

/// Resolve on SIGINT or, on unix, SIGTERM (what container runtimes send).
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("SIGINT received"),
                    _ = term.recv() => debug!("SIGTERM received"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler, listening for SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
