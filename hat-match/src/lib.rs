//! Hemilineage matching core
//!
//! Identifies which atlas hemilineages correspond to a cluster of cell bodies
//! picked in a registered light-microscopy image: candidate search by soma
//! dispersion, voxel and NBLAST-style scoring, and a persistent results
//! ledger reviewed through a [`session::ProofreadingSession`].

pub mod atlas;
pub mod config;
pub mod display;
pub mod error;
pub mod events;
pub mod ledger;
pub mod scoring;
pub mod search;
pub mod selection;
pub mod session;
pub mod threshold;
pub mod volume;

pub use atlas::{HemilineageAtlas, MaskKind, SqliteAtlas};
pub use config::MatchConfig;
pub use error::{MatchError, Result};
pub use events::{EventBus, SessionEvent};
pub use ledger::{ResultRow, ResultsLedger, ReviewStatus};
pub use scoring::{CandidateScore, ScoringMethods, ScoringReport};
pub use search::{Candidate, CandidateSearch};
pub use session::{ProofreadingSession, ScoringJob, SessionConfig, SessionState};
pub use volume::{BinaryMask, QueryImage};
