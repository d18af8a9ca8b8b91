//! Resource controller: drives the transcode target toward a desired state.
//!
//! The controller owns the single piece of mutable state in the process, the
//! last confirmed Applied State. It is updated only after the external call
//! succeeds; any failure drops it back to `Unknown`, which forces the next
//! tick to re-attempt the transition instead of assuming it happened.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::schedule::DesiredState;
use crate::tdarr::TranscodeTarget;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// External-call failure, split by whether retrying can help.
#[derive(Debug, Error)]
pub enum CallError {
    /// Timeouts, connection failures, 5xx responses, decode hiccups.
    #[error("transient call failure: {0}")]
    Transient(anyhow::Error),

    /// Authorization failures, unknown endpoints, other 4xx responses.
    /// Retrying without operator intervention cannot help.
    #[error("permanent call failure: {0}")]
    Permanent(anyhow::Error),
}

impl CallError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.status().is_some_and(|s| s.is_client_error()) {
            CallError::Permanent(e.into())
        } else {
            CallError::Transient(e.into())
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, CallError::Permanent(_))
    }
}

// ---------------------------------------------------------------------------
// Applied state
// ---------------------------------------------------------------------------

/// Last confirmed state of the transcode target.
///
/// `Unknown` is both the initial state and the recovery state after any
/// failed call. There is no terminal state; the process exiting is the only
/// terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedState {
    Paused,
    Running,
    Unknown,
}

impl AppliedState {
    /// Whether the desired state is already confirmed applied. `Unknown`
    /// never matches, so it always triggers a call.
    pub fn matches(self, desired: DesiredState) -> bool {
        self == AppliedState::from(desired)
    }
}

impl From<DesiredState> for AppliedState {
    fn from(d: DesiredState) -> Self {
        match d {
            DesiredState::Paused => AppliedState::Paused,
            DesiredState::Running => AppliedState::Running,
        }
    }
}

impl fmt::Display for AppliedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppliedState::Paused => write!(f, "paused"),
            AppliedState::Running => write!(f, "running"),
            AppliedState::Unknown => write!(f, "unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts per transition, including the first.
    pub limit: u32,
    /// Delay before the second attempt; doubles each attempt after that.
    pub base: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based count of completed attempts).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            base: Duration::from_millis(250),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Outcome of one reconcile pass, mainly for callers that need an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Desired state was already confirmed applied; no call issued.
    Skipped,
    /// Transition confirmed by the target.
    Applied,
    /// Retries exhausted or permanent failure; applied state is `Unknown`.
    Failed,
}

pub struct Controller<T> {
    target: T,
    applied: AppliedState,
    retry: RetryPolicy,
    cancel_workers: bool,
}

impl<T: TranscodeTarget> Controller<T> {
    pub fn new(target: T, retry: RetryPolicy, cancel_workers: bool) -> Self {
        Self {
            target,
            applied: AppliedState::Unknown,
            retry,
            cancel_workers,
        }
    }

    pub fn applied(&self) -> AppliedState {
        self.applied
    }

    /// Drive the target toward `desired`.
    ///
    /// Skips the call when the desired state is already confirmed applied.
    /// On a confirmed pause, in-flight worker items are cancelled best-effort
    /// (when enabled); a cancellation failure does not revoke the confirmed
    /// paused state.
    pub async fn reconcile(&mut self, desired: DesiredState) -> ReconcileOutcome {
        if self.applied.matches(desired) {
            debug!(state = %desired, "target already in desired state, skipping call");
            return ReconcileOutcome::Skipped;
        }

        let pause = desired == DesiredState::Paused;
        match self.set_paused_with_retry(pause).await {
            Ok(()) => {
                let previous = self.applied;
                self.applied = desired.into();
                info!(from = %previous, to = %desired, "transcode target transitioned");
                if pause && self.cancel_workers {
                    if let Err(e) = self.target.cancel_active_workers().await {
                        warn!(error = %e, "failed to cancel active worker items");
                    }
                }
                ReconcileOutcome::Applied
            }
            Err(e) => {
                self.applied = AppliedState::Unknown;
                if e.is_permanent() {
                    error!(state = %desired, error = %e, "transition failed permanently, operator intervention needed");
                } else {
                    warn!(state = %desired, error = %e, "transition failed, will retry next tick");
                }
                ReconcileOutcome::Failed
            }
        }
    }

    async fn set_paused_with_retry(&self, pause: bool) -> Result<(), CallError> {
        let mut attempt = 0u32;
        loop {
            match self.target.set_paused(pause).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.retry.limit.max(1) {
                        return Err(e);
                    }
                    let delay = self.retry.delay(attempt);
                    warn!(
                        attempt,
                        limit = self.retry.limit,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
