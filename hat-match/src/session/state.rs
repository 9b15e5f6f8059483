//! Proofreading session states
//!
//! Disconnected → Connected → Thresholded → AwaitingSelection → Scoring →
//! Reviewing → AwaitingSelection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No atlas connection
    Disconnected,
    /// Atlas connected, no query mask yet
    Connected,
    /// Query mask available, results table not opened
    Thresholded,
    /// Waiting for the user to pick points and confirm candidates
    AwaitingSelection,
    /// A scoring batch is running
    Scoring,
    /// Scores written, user assigning review statuses
    Reviewing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connected => "connected",
            SessionState::Thresholded => "thresholded",
            SessionState::AwaitingSelection => "awaiting_selection",
            SessionState::Scoring => "scoring",
            SessionState::Reviewing => "reviewing",
        }
    }

    /// States in which the query mask may be replaced
    pub fn allows_threshold(&self) -> bool {
        matches!(
            self,
            SessionState::Connected
                | SessionState::Thresholded
                | SessionState::AwaitingSelection
                | SessionState::Reviewing
        )
    }

    /// A query mask exists and the results table may be opened
    pub fn allows_ledger(&self) -> bool {
        matches!(
            self,
            SessionState::Thresholded | SessionState::AwaitingSelection | SessionState::Reviewing
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub session_id: Uuid,
    pub old_state: SessionState,
    pub new_state: SessionState,
    pub transitioned_at: DateTime<Utc>,
}
