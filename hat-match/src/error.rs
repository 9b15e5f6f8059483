//! Error types for hat-match
//!
//! Failure classes and how far they propagate:
//! - `Connection`: atlas unreachable or invalid, fatal to the current action
//! - `DegenerateInput`: empty tract mask, empty selection; aborts one item
//! - `ScoringFailure`: one candidate's scorer failed; isolated to that row
//! - `LedgerIo`: results table read/write failure; on-disk file left intact
//! - `NotFound`: status update on an unknown row key

use crate::session::SessionState;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for hat-match
#[derive(Debug, Error)]
pub enum MatchError {
    /// Atlas could not be opened or is not a valid atlas
    #[error("Atlas connection error: {0}")]
    Connection(String),

    /// Lookup failure on an open atlas connection
    #[error("Atlas lookup error: {0}")]
    Atlas(String),

    /// Input that cannot be scored or searched (empty mask, empty selection)
    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    /// A single candidate's scorer failed
    #[error("Scoring failed for {hemilineage}: {message}")]
    ScoringFailure { hemilineage: String, message: String },

    /// Results table could not be read or written
    #[error("Results ledger I/O error at {}: {message}", path.display())]
    LedgerIo { path: PathBuf, message: String },

    /// Requested row or hemilineage does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not permitted in the current session state
    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// Invalid user input or parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Image file could not be decoded
    #[error("Image error: {0}")]
    Image(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// hat-common error
    #[error("Common error: {0}")]
    Common(#[from] hat_common::Error),
}

impl MatchError {
    pub fn ledger_io(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        MatchError::LedgerIo {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn scoring(hemilineage: impl Into<String>, message: impl ToString) -> Self {
        MatchError::ScoringFailure {
            hemilineage: hemilineage.into(),
            message: message.to_string(),
        }
    }
}

/// Convenience Result type using MatchError
pub type Result<T> = std::result::Result<T, MatchError>;
