//! Data handed to a display collaborator
//!
//! The core never renders anything. A viewer asks for candidate artifacts
//! and draws them however it likes.

use crate::atlas::MaskKind;
use crate::error::MatchError;
use crate::scoring::Dotprops;
use crate::volume::SparseMask;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What to fetch for each candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayKind {
    Tract,
    WholeNeuron,
    CellBodyFiber,
    Skeleton,
}

impl DisplayKind {
    /// Atlas mask behind this kind, `None` for skeletons
    pub fn mask_kind(&self) -> Option<MaskKind> {
        match self {
            DisplayKind::Tract => Some(MaskKind::Tract),
            DisplayKind::WholeNeuron => Some(MaskKind::WholeNeuron),
            DisplayKind::CellBodyFiber => Some(MaskKind::CellBodyFiber),
            DisplayKind::Skeleton => None,
        }
    }
}

impl fmt::Display for DisplayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mask_kind() {
            Some(kind) => kind.fmt(f),
            None => f.write_str("skeleton"),
        }
    }
}

impl FromStr for DisplayKind {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skeleton" | "dotprops" => Ok(DisplayKind::Skeleton),
            other => match other.parse::<MaskKind>()? {
                MaskKind::Tract => Ok(DisplayKind::Tract),
                MaskKind::WholeNeuron => Ok(DisplayKind::WholeNeuron),
                MaskKind::CellBodyFiber => Ok(DisplayKind::CellBodyFiber),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactData {
    Mask(SparseMask),
    Skeleton(Dotprops),
}

impl ArtifactData {
    /// Foreground voxels or skeleton samples
    pub fn len(&self) -> usize {
        match self {
            ArtifactData::Mask(mask) => mask.len(),
            ArtifactData::Skeleton(dotprops) => dotprops.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One candidate layer for the viewer
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayArtifact {
    pub hemilineage: String,
    pub kind: DisplayKind,
    pub data: ArtifactData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("skeleton".parse::<DisplayKind>().unwrap(), DisplayKind::Skeleton);
        assert_eq!("hat".parse::<DisplayKind>().unwrap(), DisplayKind::Tract);
        assert_eq!("cbf".parse::<DisplayKind>().unwrap(), DisplayKind::CellBodyFiber);
        assert!("soma".parse::<DisplayKind>().is_err());
        assert_eq!(DisplayKind::WholeNeuron.to_string(), "whole_neuron");
    }
}
