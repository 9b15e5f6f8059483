//! Test Helper Utilities
//!
//! Shared utilities for testing hat-match

#![allow(dead_code)]

pub mod fixtures;
pub mod memory_atlas;

pub use fixtures::{
    five_hemilineage_atlas, grid, hemilineage_names, line_mask, line_skeleton, query_image, speckled_query_image,
    uniform_image, NEURITE_X, QUERY_CENTROID,
};
pub use memory_atlas::MemoryAtlas;

use hat_match::{ProofreadingSession, SessionConfig};
use std::path::Path;
use std::sync::Arc;

/// Session connected to `atlas`, thresholded, with a ledger in `dir`
pub async fn ready_session(atlas: Arc<MemoryAtlas>, dir: &Path, config: SessionConfig) -> ProofreadingSession {
    let mut session = ProofreadingSession::new(config);
    session.connect_with(atlas).await.unwrap();
    session.load_image(query_image(dir)).unwrap();
    session.auto_threshold().unwrap();
    session.open_ledger().unwrap();
    session
}
