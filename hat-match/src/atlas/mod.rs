//! Hemilineage atlas lookup service
//!
//! The atlas is read-only reference data: per hemilineage a tract mask, a
//! whole-neuron mask, a cell-body-fiber mask, a skeleton in dotprops form and
//! the left/right soma positions. Callers hold it as
//! `Arc<dyn HemilineageAtlas>`; the production backend is a SQLite file.

pub mod schema;
pub mod sqlite;

pub use sqlite::{AtlasBuilder, SqliteAtlas};

use crate::error::{MatchError, Result};
use crate::scoring::Dotprops;
use crate::volume::SparseMask;
use async_trait::async_trait;
use hat_common::Point3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Which atlas mask to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskKind {
    /// Primary neurite bundle, used for voxel scoring
    Tract,
    WholeNeuron,
    CellBodyFiber,
}

impl MaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaskKind::Tract => "tract",
            MaskKind::WholeNeuron => "whole_neuron",
            MaskKind::CellBodyFiber => "cbf",
        }
    }
}

impl fmt::Display for MaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaskKind {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tract" | "hat" => Ok(MaskKind::Tract),
            "whole_neuron" | "whole" => Ok(MaskKind::WholeNeuron),
            "cbf" | "cell_body_fiber" => Ok(MaskKind::CellBodyFiber),
            other => Err(MatchError::InvalidInput(format!("unknown mask kind '{}'", other))),
        }
    }
}

/// Body side of a soma
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SomaSide {
    Left,
    Right,
}

impl SomaSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            SomaSide::Left => "left",
            SomaSide::Right => "right",
        }
    }
}

/// Soma positions of one hemilineage, right side not yet mirrored
#[derive(Debug, Clone, PartialEq)]
pub struct SomaPopulation {
    pub hemilineage: String,
    pub left: Vec<Point3>,
    pub right: Vec<Point3>,
}

impl SomaPopulation {
    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }
}

/// Outcome of an atlas consistency check
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AtlasValidation {
    pub hemilineages: usize,
    pub expected: Option<usize>,
    pub missing_tracts: Vec<String>,
    pub missing_skeletons: Vec<String>,
}

impl AtlasValidation {
    pub fn is_valid(&self) -> bool {
        self.missing_tracts.is_empty()
            && self.missing_skeletons.is_empty()
            && self.expected.map_or(true, |n| n == self.hemilineages)
    }
}

/// Read-only hemilineage reference data
///
/// Lookups for an unknown hemilineage return `MatchError::NotFound`; failures
/// of a live backend return `MatchError::Atlas`.
#[async_trait]
pub trait HemilineageAtlas: Send + Sync {
    /// Human-readable location for logs
    fn location(&self) -> String;

    /// All hemilineage names, sorted
    async fn hemilineages(&self) -> Result<Vec<String>>;

    async fn soma_populations(&self) -> Result<Vec<SomaPopulation>>;

    async fn mask(&self, hemilineage: &str, kind: MaskKind) -> Result<SparseMask>;

    async fn skeleton(&self, hemilineage: &str) -> Result<Dotprops>;

    /// Check that every hemilineage has a tract mask and a skeleton
    async fn validate(&self, expected: Option<usize>) -> Result<AtlasValidation> {
        let names = self.hemilineages().await?;
        let mut report = AtlasValidation {
            hemilineages: names.len(),
            expected,
            ..Default::default()
        };
        for name in &names {
            match self.mask(name, MaskKind::Tract).await {
                Ok(mask) if !mask.is_empty() => {}
                Ok(_) | Err(MatchError::NotFound(_)) => report.missing_tracts.push(name.clone()),
                Err(e) => return Err(e),
            }
            match self.skeleton(name).await {
                Ok(skeleton) if !skeleton.is_empty() => {}
                Ok(_) | Err(MatchError::NotFound(_)) => report.missing_skeletons.push(name.clone()),
                Err(e) => return Err(e),
            }
        }
        if let Some(n) = expected {
            if n != names.len() {
                warn!(expected = n, found = names.len(), "Atlas hemilineage count mismatch");
            }
        }
        Ok(report)
    }

    /// Release backend resources; further lookups fail
    async fn close(&self) {}
}
