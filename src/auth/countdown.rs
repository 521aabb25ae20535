// Token age tracking for periodic reauthentication

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Display value while no token is active
pub const TIMER_STOPPED: &str = "00:00:00";

/// Tracks how long the current token has been active
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Countdown {
    started_at: Option<DateTime<Utc>>,
    refresh_requested: bool,
}

impl Countdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.started_at = Some(now);
        self.refresh_requested = false;
    }

    pub fn stop(&mut self) {
        self.started_at = None;
        self.refresh_requested = false;
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Time the token has been active, if the countdown is running
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started_at = self.started_at?;
        Some((now - started_at).to_std().unwrap_or_default())
    }

    /// True once per activation, when the token age reaches `interval`
    ///
    /// Manually set tokens are never refreshed on a timer.
    pub fn take_due(&mut self, now: DateTime<Utc>, interval: Duration, set_manually: bool) -> bool {
        if set_manually || self.refresh_requested {
            return false;
        }

        match self.elapsed(now) {
            Some(elapsed) if elapsed >= interval => {
                self.refresh_requested = true;
                true
            }
            _ => false,
        }
    }
}

/// Format a token age as `HH:MM:SS`
pub fn format_elapsed(elapsed: Option<Duration>) -> String {
    match elapsed {
        Some(elapsed) => {
            let secs = elapsed.as_secs();
            format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
        }
        None => TIMER_STOPPED.to_string(),
    }
}
