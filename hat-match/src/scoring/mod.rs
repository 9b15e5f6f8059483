//! Candidate scoring
//!
//! Two independent measures per candidate hemilineage:
//! - voxel overlap of the thresholded query with the atlas tract mask
//! - NBLAST-style similarity between query dotprops and the atlas skeleton
//!
//! Both scorers are pure functions. [`batch::run_batch`] schedules them over
//! a bounded worker pool with progress events and cooperative cancellation.

pub mod batch;
pub mod dotprops;
pub mod kdtree;
pub mod nblast;
pub mod voxel;

pub use batch::{run_batch, BatchRequest};
pub use dotprops::Dotprops;
pub use nblast::{nblast, nblast_symmetric, IndexedDotprops, NblastParams, ScoreDirection};
pub use voxel::voxel_overlap;

use hat_common::Point3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which scorers a batch runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringMethods {
    pub voxel: bool,
    pub nblast: bool,
}

impl Default for ScoringMethods {
    fn default() -> Self {
        Self {
            voxel: true,
            nblast: true,
        }
    }
}

impl ScoringMethods {
    pub fn voxel_only() -> Self {
        Self {
            voxel: true,
            nblast: false,
        }
    }

    pub fn nblast_only() -> Self {
        Self {
            voxel: false,
            nblast: true,
        }
    }

    pub fn any(&self) -> bool {
        self.voxel || self.nblast
    }
}

/// Scores for one candidate; a failing scorer leaves its score absent and
/// records why in `error`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub hemilineage: String,
    pub voxel_score: Option<f64>,
    pub nblast_score: Option<f64>,
    pub error: Option<String>,
}

impl CandidateScore {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of a scoring batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoringReport {
    pub job_id: Uuid,
    pub centroid: Point3,
    pub threshold: Option<f64>,
    pub methods: ScoringMethods,
    /// Finished candidates, in target order
    pub scores: Vec<CandidateScore>,
    /// Targets left alone because their ledger rows were already current
    pub skipped: Vec<String>,
    /// Targets not scored because the batch was cancelled
    pub not_scored: Vec<String>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl ScoringReport {
    pub fn failures(&self) -> impl Iterator<Item = &CandidateScore> {
        self.scores.iter().filter(|s| s.failed())
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }
}
