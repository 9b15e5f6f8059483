//! # hat-common
//!
//! Shared code for the hemilineage matching tools:
//! - Error and result types
//! - Configuration file resolution and TOML loading
//! - Template-space geometry (points, centroids, midline mirroring)
//! - Timestamp helpers used by the results ledger

pub mod config;
pub mod error;
pub mod geometry;
pub mod time;

pub use error::{Error, Result};
pub use geometry::Point3;
