//! Daily schedule windows mapping wall-clock time to a desired state.
//!
//! A window is a recurring `[start, end)` range of local wall-clock time
//! carrying the state that should hold inside it. Evaluation is a pure
//! function of (time, windows, default state) so it can be tested without a
//! clock. Overlap policy: windows are checked in definition order and the
//! last match wins.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Desired state
// ---------------------------------------------------------------------------

/// The state the schedule (or playback activity) says should currently hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Paused,
    Running,
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesiredState::Paused => write!(f, "paused"),
            DesiredState::Running => write!(f, "running"),
        }
    }
}

impl FromStr for DesiredState {
    type Err = ScheduleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paused" | "pause" => Ok(DesiredState::Paused),
            "running" | "resume" | "resumed" => Ok(DesiredState::Running),
            other => Err(ScheduleParseError::BadState(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Parse errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ScheduleParseError {
    #[error("invalid window {0:?}, expected HH:MM-HH:MM[=paused|running]")]
    BadWindow(String),

    #[error("invalid time {0:?}, expected HH:MM")]
    BadTime(String),

    #[error("invalid state {0:?}, expected \"paused\" or \"running\"")]
    BadState(String),
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// A daily recurring time range and the state it demands.
///
/// `end <= start` means the window wraps midnight (e.g. `22:00-06:00`);
/// `start == end` covers the whole day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub state: DesiredState,
}

impl Window {
    /// Whether `t` falls inside the window. Start inclusive, end exclusive.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            // Wraps midnight.
            t >= self.start || t < self.end
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}={}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M"),
            self.state
        )
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// An ordered set of windows plus the state that holds outside all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    windows: Vec<Window>,
    default_state: DesiredState,
}

impl Schedule {
    pub fn new(windows: Vec<Window>, default_state: DesiredState) -> Self {
        Self {
            windows,
            default_state,
        }
    }

    /// A schedule with no windows; the default state always holds.
    pub fn empty(default_state: DesiredState) -> Self {
        Self::new(Vec::new(), default_state)
    }

    /// Parse a comma-separated window list, e.g.
    /// `"22:00-06:00=paused,12:00-13:00=running"`.
    ///
    /// The `=state` suffix defaults to `paused` when omitted. An empty or
    /// whitespace-only spec yields an empty schedule.
    pub fn parse(spec: &str, default_state: DesiredState) -> Result<Self, ScheduleParseError> {
        let mut windows = Vec::new();
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (range, state) = match entry.split_once('=') {
                Some((range, state)) => (range, state.parse()?),
                None => (entry, DesiredState::Paused),
            };
            let (start, end) = range
                .split_once('-')
                .ok_or_else(|| ScheduleParseError::BadWindow(entry.to_string()))?;
            windows.push(Window {
                start: parse_time(start)?,
                end: parse_time(end)?,
                state,
            });
        }
        Ok(Self::new(windows, default_state))
    }

    /// Desired state at wall-clock time `t`. Last matching window wins;
    /// the default state applies when no window matches.
    pub fn desired_at(&self, t: NaiveTime) -> DesiredState {
        self.windows
            .iter()
            .rev()
            .find(|w| w.contains(t))
            .map(|w| w.state)
            .unwrap_or(self.default_state)
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn default_state(&self) -> DesiredState {
        self.default_state
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, ScheduleParseError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|_| ScheduleParseError::BadTime(s.trim().to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
