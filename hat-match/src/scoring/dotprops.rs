//! Point-and-tangent morphology samples
//!
//! Each sample is a location, the unit principal direction of its `k`
//! nearest neighbours and a collinearity `alpha = (λ1 - λ2) / Σλ`, where
//! λ are the eigenvalues of the neighbourhood covariance.

use super::kdtree::KdTree;
use crate::error::{MatchError, Result};
use crate::volume::BinaryMask;
use hat_common::Point3;
use rayon::prelude::*;
use std::collections::BTreeMap;

const FLOATS_PER_SAMPLE: usize = 7;

#[derive(Debug, Clone, PartialEq)]
pub struct Dotprops {
    points: Vec<Point3>,
    tangents: Vec<[f64; 3]>,
    alpha: Vec<f64>,
}

impl Dotprops {
    /// Assemble precomputed samples
    pub fn new(points: Vec<Point3>, tangents: Vec<[f64; 3]>, alpha: Vec<f64>) -> Result<Self> {
        if points.len() != tangents.len() || points.len() != alpha.len() {
            return Err(MatchError::InvalidInput(format!(
                "dotprops arrays differ in length ({} points, {} tangents, {} alpha)",
                points.len(),
                tangents.len(),
                alpha.len()
            )));
        }
        Ok(Self {
            points,
            tangents,
            alpha,
        })
    }

    /// Tangents from a PCA over each point's `k` nearest neighbours
    pub fn from_points(points: Vec<Point3>, k: usize) -> Result<Self> {
        if points.is_empty() {
            return Err(MatchError::DegenerateInput(
                "cannot build dotprops from an empty point cloud".to_string(),
            ));
        }
        let tree = KdTree::build(points.iter().map(|p| p.to_array()).collect());
        let k = k.max(2);
        let (tangents, alpha): (Vec<[f64; 3]>, Vec<f64>) = points
            .par_iter()
            .map(|p| {
                let neighbours: Vec<[f64; 3]> = tree
                    .k_nearest(p.to_array(), k)
                    .iter()
                    .map(|n| tree.point(n.index))
                    .collect();
                principal_direction(&neighbours)
            })
            .unzip();
        Ok(Self {
            points,
            tangents,
            alpha,
        })
    }

    /// Samples from a binary mask: foreground voxel centres pooled into
    /// `resample_um` bins (mean position per bin), then [`Dotprops::from_points`]
    pub fn from_mask(mask: &BinaryMask, resample_um: f64, k: usize) -> Result<Self> {
        let points = mask.foreground_points();
        if points.is_empty() {
            return Err(MatchError::DegenerateInput("mask has no foreground voxels".to_string()));
        }
        Self::from_points(bin_points(&points, resample_um), k)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point3] {
        &self.points
    }

    pub fn tangents(&self) -> &[[f64; 3]] {
        &self.tangents
    }

    pub fn alpha(&self) -> &[f64] {
        &self.alpha
    }

    /// Mirror image across the sagittal plane `x = width_um / 2`
    pub fn mirrored(&self, width_um: f64) -> Self {
        Self {
            points: self.points.iter().map(|p| p.mirrored(width_um)).collect(),
            tangents: self.tangents.iter().map(|t| [t[0], t[1], -t[2]]).collect(),
            alpha: self.alpha.clone(),
        }
    }

    /// Spatial index over the sample points
    pub fn tree(&self) -> KdTree {
        KdTree::build(self.points.iter().map(|p| p.to_array()).collect())
    }

    /// Seven little-endian f64 per sample: `z y x tz ty tx alpha`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * FLOATS_PER_SAMPLE * 8);
        for i in 0..self.len() {
            let p = self.points[i].to_array();
            let t = self.tangents[i];
            for v in [p[0], p[1], p[2], t[0], t[1], t[2], self.alpha[i]] {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let stride = FLOATS_PER_SAMPLE * 8;
        if bytes.len() % stride != 0 {
            return Err(MatchError::InvalidInput(format!(
                "dotprops blob length {} is not a multiple of {}",
                bytes.len(),
                stride
            )));
        }
        let mut points = Vec::with_capacity(bytes.len() / stride);
        let mut tangents = Vec::with_capacity(points.capacity());
        let mut alpha = Vec::with_capacity(points.capacity());
        for sample in bytes.chunks_exact(stride) {
            let mut v = [0.0f64; FLOATS_PER_SAMPLE];
            for (slot, chunk) in v.iter_mut().zip(sample.chunks_exact(8)) {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                *slot = f64::from_le_bytes(raw);
            }
            points.push(Point3::new(v[0], v[1], v[2]));
            tangents.push([v[3], v[4], v[5]]);
            alpha.push(v[6]);
        }
        Ok(Self {
            points,
            tangents,
            alpha,
        })
    }
}

/// Mean position of the points falling in each `bin_um` cube
fn bin_points(points: &[Point3], bin_um: f64) -> Vec<Point3> {
    if !(bin_um.is_finite() && bin_um > 0.0) {
        return points.to_vec();
    }
    let mut bins: BTreeMap<[i64; 3], ([f64; 3], usize)> = BTreeMap::new();
    for p in points {
        let a = p.to_array();
        let key = [
            (a[0] / bin_um).floor() as i64,
            (a[1] / bin_um).floor() as i64,
            (a[2] / bin_um).floor() as i64,
        ];
        let entry = bins.entry(key).or_insert(([0.0; 3], 0));
        for axis in 0..3 {
            entry.0[axis] += a[axis];
        }
        entry.1 += 1;
    }
    bins.into_values()
        .map(|(sum, n)| {
            let n = n as f64;
            Point3::new(sum[0] / n, sum[1] / n, sum[2] / n)
        })
        .collect()
}

/// Unit principal axis and collinearity of a neighbourhood
fn principal_direction(neighbours: &[[f64; 3]]) -> ([f64; 3], f64) {
    let n = neighbours.len() as f64;
    let mut mean = [0.0; 3];
    for p in neighbours {
        for axis in 0..3 {
            mean[axis] += p[axis] / n;
        }
    }
    let mut cov = [[0.0; 3]; 3];
    for p in neighbours {
        let d = [p[0] - mean[0], p[1] - mean[1], p[2] - mean[2]];
        for i in 0..3 {
            for j in 0..3 {
                cov[i][j] += d[i] * d[j] / n;
            }
        }
    }

    let (values, vectors) = symmetric_eigen(cov);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    let (l1, l2, l3) = (values[order[0]], values[order[1]], values[order[2]]);
    let sum = l1 + l2 + l3;
    let alpha = if sum > f64::EPSILON { (l1 - l2) / sum } else { 0.0 };
    let v = order[0];
    let tangent = [vectors[0][v], vectors[1][v], vectors[2][v]];
    (normalize(tangent), alpha)
}

fn normalize(v: [f64; 3]) -> [f64; 3] {
    let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if norm > 0.0 {
        [v[0] / norm, v[1] / norm, v[2] / norm]
    } else {
        [1.0, 0.0, 0.0]
    }
}

/// Cyclic Jacobi eigen-decomposition of a symmetric 3x3 matrix
///
/// Returns eigenvalues and a matrix whose columns are the eigenvectors.
fn symmetric_eigen(mut a: [[f64; 3]; 3]) -> ([f64; 3], [[f64; 3]; 3]) {
    let mut v = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    for _sweep in 0..50 {
        let off = a[0][1].powi(2) + a[0][2].powi(2) + a[1][2].powi(2);
        if off < 1e-24 {
            break;
        }
        for (p, q) in [(0, 1), (0, 2), (1, 2)] {
            if a[p][q].abs() < 1e-300 {
                continue;
            }
            let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
            let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
            let c = 1.0 / (t * t + 1.0).sqrt();
            let s = t * c;

            for k in 0..3 {
                let akp = a[k][p];
                let akq = a[k][q];
                a[k][p] = c * akp - s * akq;
                a[k][q] = s * akp + c * akq;
            }
            for k in 0..3 {
                let apk = a[p][k];
                let aqk = a[q][k];
                a[p][k] = c * apk - s * aqk;
                a[q][k] = s * apk + c * aqk;
            }
            for row in v.iter_mut() {
                let vkp = row[p];
                let vkq = row[q];
                row[p] = c * vkp - s * vkq;
                row[q] = s * vkp + c * vkq;
            }
        }
    }
    ([a[0][0], a[1][1], a[2][2]], v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::GridGeometry;

    #[test]
    fn test_line_has_axis_tangent_and_full_alpha() {
        let points: Vec<Point3> = (0..20).map(|i| Point3::new(0.0, 0.0, i as f64)).collect();
        let dp = Dotprops::from_points(points, 5).unwrap();
        for (t, a) in dp.tangents().iter().zip(dp.alpha()) {
            assert!((t[2].abs() - 1.0).abs() < 1e-9, "tangent {:?}", t);
            assert!((a - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_diagonal_line_tangent() {
        let points: Vec<Point3> = (0..10).map(|i| Point3::new(i as f64, i as f64, 0.0)).collect();
        let dp = Dotprops::from_points(points, 4).unwrap();
        let t = dp.tangents()[5];
        let expected = std::f64::consts::FRAC_1_SQRT_2;
        assert!((t[0].abs() - expected).abs() < 1e-9);
        assert!((t[1].abs() - expected).abs() < 1e-9);
        assert!(t[2].abs() < 1e-9);
    }

    #[test]
    fn test_plane_has_low_alpha() {
        let mut points = Vec::new();
        for y in 0..5 {
            for x in 0..5 {
                points.push(Point3::new(0.0, y as f64, x as f64));
            }
        }
        let dp = Dotprops::from_points(points, 25).unwrap();
        assert!(dp.alpha()[12] < 0.1);
    }

    #[test]
    fn test_from_mask_bins_voxels() {
        let geometry = GridGeometry::new([1, 1, 8], [1.0, 1.0, 0.5]);
        let mut mask = BinaryMask::empty(geometry);
        for x in 0..8 {
            mask.set([0, 0, x], true);
        }
        // Eight voxels at 0.5um spacing pool into four 1um bins
        let dp = Dotprops::from_mask(&mask, 1.0, 3).unwrap();
        assert_eq!(dp.len(), 4);
        assert!((dp.points()[0].x - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_empty_mask_is_degenerate() {
        let mask = BinaryMask::empty(GridGeometry::new([2, 2, 2], [1.0; 3]));
        assert!(matches!(
            Dotprops::from_mask(&mask, 1.0, 5),
            Err(MatchError::DegenerateInput(_))
        ));
    }

    #[test]
    fn test_mirrored_flips_x_and_tangent() {
        let points: Vec<Point3> = (0..10).map(|i| Point3::new(0.0, i as f64, i as f64)).collect();
        let dp = Dotprops::from_points(points, 4).unwrap();
        let mirror = dp.mirrored(100.0);
        assert_eq!(mirror.len(), dp.len());
        assert_eq!(mirror.points()[3], Point3::new(0.0, 3.0, 97.0));
        let (t, m) = (dp.tangents()[3], mirror.tangents()[3]);
        assert_eq!(m, [t[0], t[1], -t[2]]);
        assert_eq!(mirror.mirrored(100.0), dp);
    }

    #[test]
    fn test_bytes_round_trip() {
        let points: Vec<Point3> = (0..4).map(|i| Point3::new(i as f64, 1.5, -2.0)).collect();
        let dp = Dotprops::from_points(points, 3).unwrap();
        assert_eq!(Dotprops::from_bytes(&dp.to_bytes()).unwrap(), dp);
        assert!(Dotprops::from_bytes(&[0u8; 10]).is_err());
    }
}
