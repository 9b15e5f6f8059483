//! Session events and the broadcast bus that carries them
//!
//! Progress of a scoring batch, state changes and ledger saves are published
//! as `SessionEvent`s. A caller (CLI, GUI shell) subscribes; emitting never
//! blocks and never fails the operation that produced the event.

use crate::session::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Progress of a scoring batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringProgress {
    /// Candidates finished (scored or failed)
    pub completed: usize,
    /// Candidates in the batch
    pub total: usize,
    /// Percentage complete (0.0 - 100.0)
    pub percentage: f64,
    pub elapsed_ms: u64,
    /// Estimated time remaining, None until the first candidate finishes
    pub estimated_remaining_ms: Option<u64>,
}

impl ScoringProgress {
    pub fn new(completed: usize, total: usize, elapsed: Duration) -> Self {
        let elapsed_ms = elapsed.as_millis() as u64;
        let percentage = if total > 0 {
            (completed as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let estimated_remaining_ms = if completed > 0 && total > completed {
            let rate = elapsed_ms as f64 / completed as f64;
            Some(((total - completed) as f64 * rate) as u64)
        } else if completed > 0 {
            Some(0)
        } else {
            None
        };
        Self {
            completed,
            total,
            percentage,
            elapsed_ms,
            estimated_remaining_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    StateChanged {
        old_state: SessionState,
        new_state: SessionState,
        timestamp: DateTime<Utc>,
    },

    AtlasConnected {
        location: String,
        hemilineages: usize,
        timestamp: DateTime<Utc>,
    },

    ThresholdApplied {
        threshold: f64,
        foreground_voxels: usize,
        /// Otsu rather than user-supplied
        automatic: bool,
        timestamp: DateTime<Utc>,
    },

    ScoringStarted {
        job_id: Uuid,
        total: usize,
        timestamp: DateTime<Utc>,
    },

    CandidateScored {
        job_id: Uuid,
        hemilineage: String,
        voxel_score: Option<f64>,
        nblast_score: Option<f64>,
        progress: ScoringProgress,
        timestamp: DateTime<Utc>,
    },

    /// One candidate's scorer failed; the batch continues
    CandidateFailed {
        job_id: Uuid,
        hemilineage: String,
        message: String,
        progress: ScoringProgress,
        timestamp: DateTime<Utc>,
    },

    /// Candidate already has current scores in the ledger
    CandidateSkipped {
        job_id: Uuid,
        hemilineage: String,
        timestamp: DateTime<Utc>,
    },

    ScoringCancelled {
        job_id: Uuid,
        completed: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },

    ScoringCompleted {
        job_id: Uuid,
        completed: usize,
        failed: usize,
        total: usize,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    LedgerSaved {
        path: String,
        rows: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for session events
///
/// Cloning is cheap; all clones publish to the same subscribers. Events
/// emitted before a receiver subscribes are not delivered to it.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers reached, `Err` if there are none
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: SessionEvent) -> Result<usize, broadcast::error::SendError<SessionEvent>> {
        self.tx.send(event)
    }

    /// Emit, ignoring the absence of subscribers
    pub fn emit_lossy(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
