//! Environment-driven configuration.
//!
//! Everything is read from the process environment once at startup (the
//! container contract: no arguments, no config file). A missing variable
//! falls back to its default; a present-but-malformed value is a fatal
//! configuration error and the process exits with code 2 without retrying.
//!
//! Parsing goes through an explicit key/value map so tests never have to
//! mutate the real environment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::schedule::{DesiredState, Schedule};

pub const DEFAULT_JELLYFIN_URL: &str = "http://jellyfin:8096";
pub const DEFAULT_TDARR_URL: &str = "http://tdarr-server:8266";
pub const DEFAULT_STATUS_BIND: &str = "0.0.0.0:7878";
pub const DEFAULT_POLL_SEC: u64 = 10;
pub const DEFAULT_CALL_TIMEOUT_SEC: u64 = 5;
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 250;

/// Exit code used for fatal configuration errors, distinct from generic
/// startup failures.
pub const CONFIG_ERROR_EXIT_CODE: i32 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PauserConfig {
    /// Jellyfin base URL (`JELLYFIN_URL`).
    pub jellyfin_url: String,
    /// Jellyfin API key, sent as `X-Emby-Token` (`JELLYFIN_API_KEY`).
    pub jellyfin_api_key: Option<String>,
    /// Tdarr server base URL (`TDARR_URL`).
    pub tdarr_url: String,
    /// Tick interval (`POLL_SEC`, seconds, >= 1).
    pub poll_interval: Duration,
    /// Schedule windows (`PAUSE_WINDOWS`) with default state
    /// (`DEFAULT_STATE`) outside them.
    pub schedule: Schedule,
    /// Per-HTTP-call timeout (`CALL_TIMEOUT_SEC`), distinct from the tick
    /// interval.
    pub call_timeout: Duration,
    /// Max attempts per transition (`RETRY_LIMIT`, >= 1).
    pub retry_limit: u32,
    /// Backoff before the second attempt; doubles per attempt
    /// (`RETRY_BASE_MS`).
    pub retry_base: Duration,
    /// Cancel in-flight Tdarr worker items on pause (`CANCEL_WORKERS`).
    pub cancel_workers: bool,
    /// Status listener bind address (`STATUS_BIND`); `None` when disabled
    /// with `off`.
    pub status_bind: Option<SocketAddr>,
}

impl PauserConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Parse configuration from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let jellyfin_url = get("JELLYFIN_URL")
            .unwrap_or(DEFAULT_JELLYFIN_URL)
            .trim_end_matches('/')
            .to_string();
        let jellyfin_api_key = get("JELLYFIN_API_KEY").map(str::to_string);
        let tdarr_url = get("TDARR_URL")
            .unwrap_or(DEFAULT_TDARR_URL)
            .trim_end_matches('/')
            .to_string();

        let poll_sec = parse_u64("POLL_SEC", get("POLL_SEC"), DEFAULT_POLL_SEC)?;
        if poll_sec == 0 {
            return Err(ConfigError::invalid("POLL_SEC", "0", "must be at least 1"));
        }

        let default_state = match get("DEFAULT_STATE") {
            Some(v) => v
                .parse::<DesiredState>()
                .map_err(|e| ConfigError::invalid("DEFAULT_STATE", v, e))?,
            None => DesiredState::Running,
        };
        let schedule = match get("PAUSE_WINDOWS") {
            Some(spec) => Schedule::parse(spec, default_state)
                .map_err(|e| ConfigError::invalid("PAUSE_WINDOWS", spec, e))?,
            None => Schedule::empty(default_state),
        };

        let call_timeout_sec = parse_u64(
            "CALL_TIMEOUT_SEC",
            get("CALL_TIMEOUT_SEC"),
            DEFAULT_CALL_TIMEOUT_SEC,
        )?;
        if call_timeout_sec == 0 {
            return Err(ConfigError::invalid(
                "CALL_TIMEOUT_SEC",
                "0",
                "must be at least 1",
            ));
        }

        let retry_limit = parse_u64(
            "RETRY_LIMIT",
            get("RETRY_LIMIT"),
            u64::from(DEFAULT_RETRY_LIMIT),
        )?;
        if retry_limit == 0 || retry_limit > u64::from(u32::MAX) {
            return Err(ConfigError::invalid(
                "RETRY_LIMIT",
                &retry_limit.to_string(),
                "must be between 1 and 4294967295",
            ));
        }

        let retry_base_ms = parse_u64("RETRY_BASE_MS", get("RETRY_BASE_MS"), DEFAULT_RETRY_BASE_MS)?;

        let cancel_workers = match get("CANCEL_WORKERS") {
            Some(v) => parse_bool("CANCEL_WORKERS", v)?,
            None => true,
        };

        let status_bind = match get("STATUS_BIND") {
            Some(v) if v.eq_ignore_ascii_case("off") => None,
            Some(v) => Some(
                v.parse::<SocketAddr>()
                    .map_err(|e| ConfigError::invalid("STATUS_BIND", v, e))?,
            ),
            None => Some(
                DEFAULT_STATUS_BIND
                    .parse()
                    .expect("default status bind is valid"),
            ),
        };

        Ok(Self {
            jellyfin_url,
            jellyfin_api_key,
            tdarr_url,
            poll_interval: Duration::from_secs(poll_sec),
            schedule,
            call_timeout: Duration::from_secs(call_timeout_sec),
            retry_limit: retry_limit as u32,
            retry_base: Duration::from_millis(retry_base_ms),
            cancel_workers,
            status_bind,
        })
    }
}

impl Default for PauserConfig {
    fn default() -> Self {
        Self::from_vars(&HashMap::new()).expect("defaults are valid")
    }
}

fn parse_u64(key: &'static str, value: Option<&str>, default: u64) -> Result<u64, ConfigError> {
    match value {
        Some(v) => v.parse().map_err(|e| ConfigError::invalid(key, v, e)),
        None => Ok(default),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected a boolean")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
