//! Liveness inference from heartbeat gaps.
//!
//! Sessions never announce disconnection. A session is live while the gap
//! since its last poll stays inside a window that is several poll intervals
//! wide, and stale once it does not.

use chrono::TimeDelta;

/// Inferred session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The session has never polled.
    Unknown,
    /// Polled within the status window.
    Live,
    /// Polled before, but not within the status window.
    Stale,
}

/// Liveness thresholds, in whole seconds.
///
/// The status window drives what operators see; the looser submit window
/// gates command queuing so that a view that is a few seconds old does not
/// reject a command to an agent that is still polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    poll_interval_secs: i64,
    status_window_secs: i64,
    submit_window_secs: i64,
}

impl Default for LivenessPolicy {
    /// 3s polls; status window 5x, submit window 10x the interval.
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
            status_window_secs: 15,
            submit_window_secs: 30,
        }
    }
}

impl LivenessPolicy {
    /// Build a policy without validation. See `LivenessConfig::validate`.
    #[must_use]
    pub const fn new(poll_interval_secs: i64, status_window_secs: i64, submit_window_secs: i64) -> Self {
        Self {
            poll_interval_secs,
            status_window_secs,
            submit_window_secs,
        }
    }

    #[must_use]
    pub const fn poll_interval_secs(&self) -> i64 {
        self.poll_interval_secs
    }

    #[must_use]
    pub const fn status_window_secs(&self) -> i64 {
        self.status_window_secs
    }

    #[must_use]
    pub const fn submit_window_secs(&self) -> i64 {
        self.submit_window_secs
    }

    /// Classify a session from the seconds since its last poll.
    #[must_use]
    pub const fn classify(&self, elapsed_secs: Option<i64>) -> Liveness {
        match elapsed_secs {
            None => Liveness::Unknown,
            Some(elapsed) if elapsed <= self.status_window_secs => Liveness::Live,
            Some(_) => Liveness::Stale,
        }
    }

    /// Whether a command may be queued for a session last seen `elapsed` ago.
    ///
    /// Compared unrounded: anything past the window is rejected, even by a
    /// fraction of a second.
    #[must_use]
    pub fn permits_submit(&self, elapsed: TimeDelta) -> bool {
        elapsed <= TimeDelta::seconds(self.submit_window_secs)
    }
}
