//! NBLAST-style morphological similarity
//!
//! For each sample of the "from" cloud the nearest sample of the "to" cloud
//! contributes `2 * exp(-d² / 2σ²) * |t · t'| - 1`, which lies in [-1, 1].
//! The score is the mean over the "from" samples, so a cloud compared with
//! itself scores 1. With `use_alpha` the tangent term is weighted by
//! `sqrt(alpha * alpha')`, which discounts samples in blobby regions.
//!
//! Atlas skeletons are traced on one hemisphere. With `symmetric` set the
//! skeleton is also scored mirrored across the sagittal midplane and the
//! better side is kept.

use super::dotprops::Dotprops;
use super::kdtree::KdTree;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Which cloud drives the comparison
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDirection {
    /// Atlas skeleton samples looked up in the query image cloud
    #[default]
    AtlasToImage,
    ImageToAtlas,
    /// Mean of both directions
    Mean,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NblastParams {
    /// Distance scale of the Gaussian term, microns
    pub sigma_um: f64,
    /// Neighbours used for query tangents
    pub k: usize,
    /// Bin size used to thin query voxels before building dotprops
    pub resample_um: f64,
    pub direction: ScoreDirection,
    /// Score the skeleton and its mirror image, keep the better
    pub symmetric: bool,
    /// Weight the tangent term by sample collinearity
    pub use_alpha: bool,
    /// Keep only the largest connected component of the query mask
    pub drop_fluff: bool,
}

impl Default for NblastParams {
    fn default() -> Self {
        Self {
            sigma_um: 3.0,
            k: 100,
            resample_um: 1.0,
            direction: ScoreDirection::AtlasToImage,
            symmetric: true,
            use_alpha: false,
            drop_fluff: true,
        }
    }
}

/// Dotprops with a prebuilt spatial index
#[derive(Debug, Clone)]
pub struct IndexedDotprops {
    dotprops: Dotprops,
    tree: KdTree,
}

impl IndexedDotprops {
    pub fn new(dotprops: Dotprops) -> Self {
        let tree = dotprops.tree();
        Self { dotprops, tree }
    }

    pub fn dotprops(&self) -> &Dotprops {
        &self.dotprops
    }

    pub fn tree(&self) -> &KdTree {
        &self.tree
    }
}

/// Mean per-sample score of `from` against `to`; `None` if either is empty
pub fn directed_score(from: &Dotprops, to: &IndexedDotprops, sigma_um: f64, use_alpha: bool) -> Option<f64> {
    if from.is_empty() || to.dotprops.is_empty() {
        return None;
    }
    let two_sigma_sq = 2.0 * sigma_um * sigma_um;
    let to_tangents = to.dotprops.tangents();
    let to_alpha = to.dotprops.alpha();
    let from_alpha = from.alpha();
    let sum: f64 = (0..from.len())
        .into_par_iter()
        .map(|i| {
            let (p, t) = (from.points()[i], from.tangents()[i]);
            let Some(nearest) = to.tree.nearest(p.to_array()) else {
                return -1.0;
            };
            let t2 = to_tangents[nearest.index];
            let mut dot = (t[0] * t2[0] + t[1] * t2[1] + t[2] * t2[2]).abs().min(1.0);
            if use_alpha {
                dot *= (from_alpha[i] * to_alpha[nearest.index]).max(0.0).sqrt();
            }
            let spatial = if two_sigma_sq > 0.0 {
                (-(nearest.distance * nearest.distance) / two_sigma_sq).exp()
            } else if nearest.distance == 0.0 {
                1.0
            } else {
                0.0
            };
            2.0 * spatial * dot - 1.0
        })
        .sum();
    Some((sum / from.len() as f64).clamp(-1.0, 1.0))
}

/// Similarity between the query image cloud and an atlas skeleton
pub fn nblast(query: &IndexedDotprops, atlas: &Dotprops, params: &NblastParams) -> Option<f64> {
    let (sigma, alpha) = (params.sigma_um, params.use_alpha);
    match params.direction {
        ScoreDirection::AtlasToImage => directed_score(atlas, query, sigma, alpha),
        ScoreDirection::ImageToAtlas => {
            let atlas = IndexedDotprops::new(atlas.clone());
            directed_score(query.dotprops(), &atlas, sigma, alpha)
        }
        ScoreDirection::Mean => {
            let forward = directed_score(atlas, query, sigma, alpha)?;
            let atlas = IndexedDotprops::new(atlas.clone());
            let reverse = directed_score(query.dotprops(), &atlas, sigma, alpha)?;
            Some((forward + reverse) / 2.0)
        }
    }
}

/// [`nblast`], also trying the skeleton mirrored at `mirror_width_um` when
/// `params.symmetric` is set
pub fn nblast_symmetric(
    query: &IndexedDotprops,
    atlas: &Dotprops,
    params: &NblastParams,
    mirror_width_um: f64,
) -> Option<f64> {
    let direct = nblast(query, atlas, params);
    if !params.symmetric {
        return direct;
    }
    let mirrored = nblast(query, &atlas.mirrored(mirror_width_um), params);
    match (direct, mirrored) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hat_common::Point3;

    fn line(offset_y: f64, along_z: bool) -> Dotprops {
        let points = (0..30)
            .map(|i| {
                let s = i as f64;
                if along_z {
                    Point3::new(s, offset_y, 0.0)
                } else {
                    Point3::new(0.0, offset_y, s)
                }
            })
            .collect();
        Dotprops::from_points(points, 5).unwrap()
    }

    #[test]
    fn test_self_similarity_is_one() {
        let a = line(0.0, false);
        let indexed = IndexedDotprops::new(a.clone());
        for direction in [ScoreDirection::AtlasToImage, ScoreDirection::ImageToAtlas, ScoreDirection::Mean] {
            let params = NblastParams {
                direction,
                ..Default::default()
            };
            let score = nblast(&indexed, &a, &params).unwrap();
            assert!((score - 1.0).abs() < 1e-9, "{:?} gave {}", direction, score);
        }
    }

    #[test]
    fn test_score_decreases_with_offset() {
        let query = IndexedDotprops::new(line(0.0, false));
        let params = NblastParams::default();
        let near = nblast(&query, &line(1.0, false), &params).unwrap();
        let far = nblast(&query, &line(8.0, false), &params).unwrap();
        assert!(near < 1.0);
        assert!(far < near);
        assert!(far >= -1.0);
    }

    #[test]
    fn test_perpendicular_lines_score_low() {
        let query = IndexedDotprops::new(line(0.0, false));
        let score = nblast(&query, &line(0.0, true), &NblastParams::default()).unwrap();
        assert!(score < 0.0, "perpendicular score {}", score);
    }

    #[test]
    fn test_empty_cloud_is_absent() {
        let query = IndexedDotprops::new(line(0.0, false));
        let empty = Dotprops::new(vec![], vec![], vec![]).unwrap();
        assert_eq!(directed_score(&empty, &query, 3.0, false), None);
    }

    fn diagonal(points: impl Iterator<Item = Point3>) -> Dotprops {
        Dotprops::from_points(points.collect(), 5).unwrap()
    }

    #[test]
    fn test_contralateral_skeleton_matches_when_symmetric() {
        // Query runs diagonally in y/x; the skeleton is its mirror at x' = 100 - x
        let query = IndexedDotprops::new(diagonal((0..30).map(|i| Point3::new(0.0, i as f64, i as f64))));
        let skeleton = diagonal((0..30).map(|i| Point3::new(0.0, i as f64, 100.0 - i as f64)));

        let one_sided = NblastParams {
            symmetric: false,
            ..Default::default()
        };
        let plain = nblast_symmetric(&query, &skeleton, &one_sided, 100.0).unwrap();
        assert!(plain < -0.9, "one-sided score {}", plain);

        let both = nblast_symmetric(&query, &skeleton, &NblastParams::default(), 100.0).unwrap();
        assert!((both - 1.0).abs() < 1e-9, "symmetric score {}", both);
    }

    #[test]
    fn test_symmetric_keeps_ipsilateral_score() {
        let a = line(0.0, false);
        let query = IndexedDotprops::new(a.clone());
        let score = nblast_symmetric(&query, &a, &NblastParams::default(), 627.0).unwrap();
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_alpha_weighting_discounts_blobby_samples() {
        let mut points = Vec::new();
        for y in 0..5 {
            for x in 0..5 {
                points.push(Point3::new(0.0, y as f64, x as f64));
            }
        }
        let blob = Dotprops::from_points(points, 25).unwrap();
        let query = IndexedDotprops::new(blob.clone());
        let weighted = NblastParams {
            use_alpha: true,
            ..Default::default()
        };
        let plain = nblast(&query, &blob, &NblastParams::default()).unwrap();
        let discounted = nblast(&query, &blob, &weighted).unwrap();
        assert!((plain - 1.0).abs() < 1e-9);
        assert!(discounted < 0.0, "alpha weighted score {}", discounted);

        let line = line(0.0, false);
        let query = IndexedDotprops::new(line.clone());
        assert!((nblast(&query, &line, &weighted).unwrap() - 1.0).abs() < 1e-9);
    }
}
