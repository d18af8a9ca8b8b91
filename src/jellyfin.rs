//! Jellyfin session polling.
//!
//! The control loop only needs one fact from Jellyfin: how many sessions are
//! actively playing video right now. A session counts as active when its
//! play state is not paused and the item being played is a video (audio
//! playback does not block transcoding).

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::controller::CallError;

/// Source of playback activity, abstracted so the engine can be driven by a
/// fake in tests.
#[async_trait::async_trait]
pub trait ActivitySource: Send + Sync {
    /// Number of sessions actively playing video (unpaused).
    async fn active_playback_count(&self) -> Result<usize, CallError>;
}

// ---------------------------------------------------------------------------
// Wire models
// ---------------------------------------------------------------------------

/// One entry of the `/Sessions` response, reduced to the fields we read.
/// Everything is optional; Jellyfin omits keys for idle sessions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Session {
    pub client: Option<String>,
    pub user_name: Option<String>,
    pub play_state: Option<PlayState>,
    pub now_playing_item: Option<NowPlayingItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PlayState {
    pub is_paused: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NowPlayingItem {
    pub media_type: Option<String>,
}

impl Session {
    /// Active means: explicitly unpaused, and the current item is a video.
    pub fn is_active_video(&self) -> bool {
        let unpaused = self
            .play_state
            .as_ref()
            .and_then(|p| p.is_paused)
            .is_some_and(|paused| !paused);
        let video = self
            .now_playing_item
            .as_ref()
            .and_then(|n| n.media_type.as_deref())
            == Some("Video");
        unpaused && video
    }
}

/// Count sessions actively playing video. Pure so it is testable without a
/// server.
pub fn count_active(sessions: &[Session]) -> usize {
    sessions.iter().filter(|s| s.is_active_video()).count()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the Jellyfin `/Sessions` endpoint.
pub struct JellyfinClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl JellyfinClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Jellyfin HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Fetch and decode the full session list.
    pub async fn sessions(&self) -> Result<Vec<Session>, CallError> {
        let mut request = self.client.get(format!("{}/Sessions", self.base_url));
        if let Some(key) = &self.api_key {
            request = request.header("X-Emby-Token", key);
        }
        let response = request
            .send()
            .await
            .map_err(CallError::from_reqwest)?
            .error_for_status()
            .map_err(CallError::from_reqwest)?;
        let sessions: Vec<Session> = response.json().await.map_err(CallError::from_reqwest)?;
        Ok(sessions)
    }
}

#[async_trait::async_trait]
impl ActivitySource for JellyfinClient {
    async fn active_playback_count(&self) -> Result<usize, CallError> {
        let sessions = self.sessions().await?;
        debug!(total = sessions.len(), "fetched jellyfin sessions");
        for s in &sessions {
            trace!(
                user = s.user_name.as_deref().unwrap_or("unknown"),
                client = s.client.as_deref().unwrap_or("unknown"),
                paused = ?s.play_state.as_ref().and_then(|p| p.is_paused),
                media = ?s.now_playing_item.as_ref().and_then(|n| n.media_type.as_deref()),
                active = s.is_active_video(),
                "session"
            );
        }
        Ok(count_active(&sessions))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
