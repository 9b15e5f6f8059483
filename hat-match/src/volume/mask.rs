//! Binary voxel masks
//!
//! `BinaryMask` is the dense form used for the thresholded query and for
//! overlap counting. `SparseMask` stores only foreground voxel indices and is
//! how atlas masks are kept on disk and in memory between lookups.

use super::GridGeometry;
use crate::error::{MatchError, Result};
use hat_common::Point3;
use std::collections::VecDeque;

/// Dense boolean voxel grid
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryMask {
    geometry: GridGeometry,
    voxels: Vec<bool>,
    threshold: Option<f64>,
}

impl BinaryMask {
    pub fn new(geometry: GridGeometry, voxels: Vec<bool>) -> Result<Self> {
        geometry.validate()?;
        if voxels.len() != geometry.len() {
            return Err(MatchError::InvalidInput(format!(
                "mask has {} voxels, grid {:?} needs {}",
                voxels.len(),
                geometry.dims,
                geometry.len()
            )));
        }
        Ok(Self {
            geometry,
            voxels,
            threshold: None,
        })
    }

    /// Caller guarantees `voxels.len() == geometry.len()`
    pub(crate) fn from_parts(geometry: GridGeometry, voxels: Vec<bool>) -> Self {
        debug_assert_eq!(voxels.len(), geometry.len());
        Self {
            geometry,
            voxels,
            threshold: None,
        }
    }

    pub fn empty(geometry: GridGeometry) -> Self {
        Self {
            voxels: vec![false; geometry.len()],
            geometry,
            threshold: None,
        }
    }

    /// Record the intensity threshold that produced this mask
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn voxels(&self) -> &[bool] {
        &self.voxels
    }

    pub fn get(&self, zyx: [usize; 3]) -> bool {
        self.voxels[self.geometry.linear_index(zyx)]
    }

    pub fn set(&mut self, zyx: [usize; 3], value: bool) {
        let index = self.geometry.linear_index(zyx);
        self.voxels[index] = value;
    }

    /// Number of foreground voxels
    pub fn count(&self) -> usize {
        self.voxels.iter().filter(|&&v| v).count()
    }

    pub fn foreground_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.voxels
            .iter()
            .enumerate()
            .filter_map(|(i, &v)| v.then_some(i))
    }

    /// Physical centres of all foreground voxels
    pub fn foreground_points(&self) -> Vec<Point3> {
        self.foreground_indices()
            .map(|i| self.geometry.position_of_index(i))
            .collect()
    }

    /// Only the largest 26-connected foreground component
    ///
    /// Ties go to the component holding the lowest voxel index. The recorded
    /// threshold is kept.
    pub fn largest_component(&self) -> BinaryMask {
        let [nz, ny, nx] = self.geometry.dims;
        let mut label = vec![0u32; self.voxels.len()];
        let mut best: Option<(u32, usize)> = None;
        let mut next = 0u32;
        let mut queue = VecDeque::new();

        for seed in 0..self.voxels.len() {
            if !self.voxels[seed] || label[seed] != 0 {
                continue;
            }
            next += 1;
            label[seed] = next;
            queue.push_back(seed);
            let mut size = 0usize;
            while let Some(index) = queue.pop_front() {
                size += 1;
                let [z, y, x] = self.geometry.voxel_of(index);
                for dz in -1i64..=1 {
                    for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            let (nz2, ny2, nx2) = (z as i64 + dz, y as i64 + dy, x as i64 + dx);
                            if nz2 < 0 || ny2 < 0 || nx2 < 0 {
                                continue;
                            }
                            let (nz2, ny2, nx2) = (nz2 as usize, ny2 as usize, nx2 as usize);
                            if nz2 >= nz || ny2 >= ny || nx2 >= nx {
                                continue;
                            }
                            let neighbour = self.geometry.linear_index([nz2, ny2, nx2]);
                            if self.voxels[neighbour] && label[neighbour] == 0 {
                                label[neighbour] = next;
                                queue.push_back(neighbour);
                            }
                        }
                    }
                }
            }
            if best.map_or(true, |(_, largest)| size > largest) {
                best = Some((next, size));
            }
        }

        let keep = best.map_or(0, |(id, _)| id);
        BinaryMask {
            geometry: self.geometry,
            voxels: label.iter().map(|&l| keep != 0 && l == keep).collect(),
            threshold: self.threshold,
        }
    }

    /// Nearest-neighbour resampling onto another grid
    ///
    /// Only target voxels inside the physical bounding box of this mask's
    /// foreground are visited.
    pub fn resample_to(&self, target: &GridGeometry) -> BinaryMask {
        if self.geometry.same_grid(target) {
            return BinaryMask {
                geometry: *target,
                voxels: self.voxels.clone(),
                threshold: self.threshold,
            };
        }

        let mut out = BinaryMask::empty(*target);
        let Some((lo, hi)) = self.foreground_bounds() else {
            return out;
        };

        // Expand by half a source voxel so boundary voxels map back inside
        let mut ranges = [(0usize, 0usize); 3];
        for axis in 0..3 {
            let half = self.geometry.spacing[axis] / 2.0;
            let min_phys = self.geometry.origin[axis] + lo[axis] as f64 * self.geometry.spacing[axis] - half;
            let max_phys = self.geometry.origin[axis] + hi[axis] as f64 * self.geometry.spacing[axis] + half;
            let start = ((min_phys - target.origin[axis]) / target.spacing[axis]).floor().max(0.0);
            let end = ((max_phys - target.origin[axis]) / target.spacing[axis]).ceil();
            let end = end.min(target.dims[axis] as f64 - 1.0);
            if end < start {
                return out;
            }
            ranges[axis] = (start as usize, end as usize);
        }

        for z in ranges[0].0..=ranges[0].1 {
            for y in ranges[1].0..=ranges[1].1 {
                for x in ranges[2].0..=ranges[2].1 {
                    let p = target.position([z, y, x]);
                    if let Some(src) = self.geometry.nearest_voxel(&p) {
                        if self.get(src) {
                            out.set([z, y, x], true);
                        }
                    }
                }
            }
        }
        out
    }

    /// Inclusive voxel-index bounding box of the foreground
    fn foreground_bounds(&self) -> Option<([usize; 3], [usize; 3])> {
        let mut bounds: Option<([usize; 3], [usize; 3])> = None;
        for index in self.foreground_indices() {
            let v = self.geometry.voxel_of(index);
            bounds = Some(match bounds {
                None => (v, v),
                Some((lo, hi)) => (
                    [lo[0].min(v[0]), lo[1].min(v[1]), lo[2].min(v[2])],
                    [hi[0].max(v[0]), hi[1].max(v[1]), hi[2].max(v[2])],
                ),
            });
        }
        bounds
    }

    pub fn to_sparse(&self) -> SparseMask {
        SparseMask {
            geometry: self.geometry,
            indices: self.foreground_indices().map(|i| i as u32).collect(),
        }
    }
}

/// Foreground voxel indices of a mask, sorted and unique
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMask {
    geometry: GridGeometry,
    indices: Vec<u32>,
}

impl SparseMask {
    pub fn new(geometry: GridGeometry, mut indices: Vec<u32>) -> Result<Self> {
        geometry.validate()?;
        indices.sort_unstable();
        indices.dedup();
        if let Some(&last) = indices.last() {
            if last as usize >= geometry.len() {
                return Err(MatchError::InvalidInput(format!(
                    "voxel index {} outside grid of {} voxels",
                    last,
                    geometry.len()
                )));
            }
        }
        Ok(Self { geometry, indices })
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Indices of `self` that are set in `mask`
    ///
    /// Meant for masks on the same grid; indices beyond `mask` never count.
    pub fn count_in(&self, mask: &BinaryMask) -> usize {
        let voxels = mask.voxels();
        self.indices
            .iter()
            .filter(|&&i| voxels.get(i as usize).copied().unwrap_or(false))
            .count()
    }

    pub fn to_dense(&self) -> BinaryMask {
        let mut mask = BinaryMask::empty(self.geometry);
        for &i in &self.indices {
            mask.voxels[i as usize] = true;
        }
        mask
    }

    /// Little-endian u32 indices
    pub fn to_bytes(&self) -> Vec<u8> {
        self.indices.iter().flat_map(|i| i.to_le_bytes()).collect()
    }

    pub fn from_bytes(geometry: GridGeometry, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(MatchError::InvalidInput(format!(
                "mask blob length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let indices = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        SparseMask::new(geometry, indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(dims: [usize; 3], spacing: f64) -> GridGeometry {
        GridGeometry::new(dims, [spacing; 3])
    }

    #[test]
    fn test_count_and_sparse_lookup() {
        let geometry = cube([2, 2, 2], 1.0);
        let a = BinaryMask::new(geometry, vec![true, true, false, false, true, false, false, false]).unwrap();
        let b = BinaryMask::new(geometry, vec![true, false, false, false, true, true, false, false]).unwrap();
        assert_eq!(a.count(), 3);
        assert_eq!(b.to_sparse().count_in(&a), 2);
        assert_eq!(a.to_sparse().count_in(&BinaryMask::empty(cube([1, 1, 1], 1.0))), 0);
    }

    #[test]
    fn test_largest_component_drops_speckle() {
        let mut mask = BinaryMask::empty(cube([5, 5, 8], 1.0)).with_threshold(40.0);
        for x in 0..6 {
            mask.set([2, 2, x], true);
        }
        // Diagonal neighbour joins the line
        mask.set([3, 3, 6], true);
        mask.set([0, 0, 7], true);
        mask.set([4, 4, 0], true);
        mask.set([4, 4, 1], true);

        let kept = mask.largest_component();
        assert_eq!(kept.count(), 7);
        assert!(kept.get([3, 3, 6]));
        assert!(!kept.get([0, 0, 7]));
        assert!(!kept.get([4, 4, 0]));
        assert_eq!(kept.threshold(), Some(40.0));
    }

    #[test]
    fn test_largest_component_of_empty_mask() {
        let mask = BinaryMask::empty(cube([2, 2, 2], 1.0));
        assert_eq!(mask.largest_component().count(), 0);
    }

    #[test]
    fn test_sparse_bytes_round_trip() {
        let geometry = cube([4, 4, 4], 1.0);
        let sparse = SparseMask::new(geometry, vec![9, 3, 3, 60]).unwrap();
        assert_eq!(sparse.indices(), &[3, 9, 60]);
        let decoded = SparseMask::from_bytes(geometry, &sparse.to_bytes()).unwrap();
        assert_eq!(decoded, sparse);
        assert_eq!(decoded.to_dense().count(), 3);
    }

    #[test]
    fn test_sparse_rejects_out_of_range() {
        assert!(SparseMask::new(cube([2, 2, 2], 1.0), vec![8]).is_err());
    }

    #[test]
    fn test_resample_to_coarser_grid() {
        // 4x4x4 at 1um -> 2x2x2 at 2um; voxel (2,2,2) sits at 2um which is
        // the centre of coarse voxel (1,1,1)
        let mut fine = BinaryMask::empty(cube([4, 4, 4], 1.0));
        fine.set([2, 2, 2], true);
        let coarse = fine.resample_to(&cube([2, 2, 2], 2.0));
        assert_eq!(coarse.count(), 1);
        assert!(coarse.get([1, 1, 1]));
    }

    #[test]
    fn test_resample_to_finer_grid_fills_block() {
        let mut coarse = BinaryMask::empty(cube([2, 2, 2], 2.0));
        coarse.set([0, 0, 0], true);
        let fine = coarse.resample_to(&cube([4, 4, 4], 1.0));
        // 1um / 2um = 0.5 rounds away from zero, so only the origin voxel maps back
        assert!(fine.get([0, 0, 0]));
        assert!(!fine.get([0, 0, 1]));
        assert!(!fine.get([3, 3, 3]));
        assert_eq!(fine.count(), 1);
    }

    #[test]
    fn test_resample_identity_keeps_voxels() {
        let geometry = cube([2, 2, 2], 1.0);
        let mut mask = BinaryMask::empty(geometry);
        mask.set([1, 0, 1], true);
        assert_eq!(mask.resample_to(&geometry).voxels(), mask.voxels());
    }
}
