//! Voxel volumes in template space
//!
//! Grids are stored `[z, y, x]` with x varying fastest, so the linear index
//! of voxel `(z, y, x)` is `(z * ny + y) * nx + x`. Physical positions are
//! `origin + index * spacing` in microns.

pub mod mask;
pub mod nrrd;

pub use mask::{BinaryMask, SparseMask};

use crate::error::{MatchError, Result};
use hat_common::Point3;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Shape and physical placement of a voxel grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    /// Voxel counts `[nz, ny, nx]`
    pub dims: [usize; 3],
    /// Voxel size in microns `[sz, sy, sx]`
    pub spacing: [f64; 3],
    /// Position of voxel `(0, 0, 0)` in microns `[oz, oy, ox]`
    pub origin: [f64; 3],
}

impl GridGeometry {
    pub fn new(dims: [usize; 3], spacing: [f64; 3]) -> Self {
        Self {
            dims,
            spacing,
            origin: [0.0; 3],
        }
    }

    pub fn with_origin(mut self, origin: [f64; 3]) -> Self {
        self.origin = origin;
        self
    }

    /// Total voxel count
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.dims.iter().any(|&d| d == 0) {
            return Err(MatchError::InvalidInput(format!(
                "grid dimensions must be non-zero, got {:?}",
                self.dims
            )));
        }
        if self.spacing.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(MatchError::InvalidInput(format!(
                "voxel spacing must be positive, got {:?}",
                self.spacing
            )));
        }
        if self.len() > u32::MAX as usize {
            return Err(MatchError::InvalidInput(format!(
                "grid of {} voxels exceeds the supported size",
                self.len()
            )));
        }
        Ok(())
    }

    pub fn linear_index(&self, zyx: [usize; 3]) -> usize {
        (zyx[0] * self.dims[1] + zyx[1]) * self.dims[2] + zyx[2]
    }

    pub fn voxel_of(&self, index: usize) -> [usize; 3] {
        let plane = self.dims[1] * self.dims[2];
        let z = index / plane;
        let rem = index % plane;
        [z, rem / self.dims[2], rem % self.dims[2]]
    }

    /// Physical centre of a voxel
    pub fn position(&self, zyx: [usize; 3]) -> Point3 {
        Point3::new(
            self.origin[0] + zyx[0] as f64 * self.spacing[0],
            self.origin[1] + zyx[1] as f64 * self.spacing[1],
            self.origin[2] + zyx[2] as f64 * self.spacing[2],
        )
    }

    pub fn position_of_index(&self, index: usize) -> Point3 {
        self.position(self.voxel_of(index))
    }

    /// Voxel whose centre is nearest to `p`, if `p` falls inside the grid
    pub fn nearest_voxel(&self, p: &Point3) -> Option<[usize; 3]> {
        let coords = p.to_array();
        let mut out = [0usize; 3];
        for axis in 0..3 {
            let r = ((coords[axis] - self.origin[axis]) / self.spacing[axis]).round();
            if !r.is_finite() || r < 0.0 || r >= self.dims[axis] as f64 {
                return None;
            }
            out[axis] = r as usize;
        }
        Some(out)
    }

    /// Same dims, spacing and origin
    pub fn same_grid(&self, other: &GridGeometry) -> bool {
        self == other
    }
}

/// Native sample type of a query image, which bounds manual thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    U8,
    U16,
    I16,
    F32,
}

impl PixelType {
    /// Inclusive representable range, `None` for floating point
    pub fn native_range(&self) -> Option<(f64, f64)> {
        match self {
            PixelType::U8 => Some((0.0, 255.0)),
            PixelType::U16 => Some((0.0, 65535.0)),
            PixelType::I16 => Some((-32768.0, 32767.0)),
            PixelType::F32 => None,
        }
    }
}

/// Registered single-channel 3-D grayscale image
#[derive(Debug, Clone)]
pub struct QueryImage {
    name: String,
    source: Option<PathBuf>,
    geometry: GridGeometry,
    pixel_type: PixelType,
    data: Vec<f32>,
}

impl QueryImage {
    pub fn new(
        name: impl Into<String>,
        geometry: GridGeometry,
        pixel_type: PixelType,
        data: Vec<f32>,
    ) -> Result<Self> {
        geometry.validate()?;
        if data.len() != geometry.len() {
            return Err(MatchError::Image(format!(
                "expected {} samples for dims {:?}, got {}",
                geometry.len(),
                geometry.dims,
                data.len()
            )));
        }
        Ok(Self {
            name: name.into(),
            source: None,
            geometry,
            pixel_type,
            data,
        })
    }

    /// Attach the file the image was read from; determines the ledger path
    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }

    /// Read a NRRD file; the image name is the file stem
    pub fn from_nrrd(path: &Path) -> Result<Self> {
        let volume = nrrd::read_nrrd(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "query".to_string());
        Ok(QueryImage::new(name, volume.geometry, volume.pixel_type, volume.data)?.with_source(path))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Minimum and maximum intensity
    pub fn intensity_range(&self) -> Option<(f32, f32)> {
        let mut iter = self.data.iter().copied().filter(|v| v.is_finite());
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }

    /// Results table location derived from the image source path
    pub fn ledger_path(&self) -> Option<PathBuf> {
        self.source.as_deref().map(ledger_path_for)
    }
}

/// `<dir>/<stem>_results.csv` next to the image file
pub fn ledger_path_for(image_path: &Path) -> PathBuf {
    let stem = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "query".to_string());
    image_path.with_file_name(format!("{}_results.csv", stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_round_trip() {
        let geometry = GridGeometry::new([3, 4, 5], [1.0, 1.0, 1.0]);
        for index in 0..geometry.len() {
            assert_eq!(geometry.linear_index(geometry.voxel_of(index)), index);
        }
        assert_eq!(geometry.linear_index([1, 2, 3]), 6 * 5 + 3);
    }

    #[test]
    fn test_position_and_nearest_voxel() {
        let geometry = GridGeometry::new([10, 10, 10], [2.0, 0.5, 1.0]).with_origin([1.0, 0.0, 0.0]);
        let p = geometry.position([3, 4, 5]);
        assert_eq!(p, Point3::new(7.0, 2.0, 5.0));
        assert_eq!(geometry.nearest_voxel(&p), Some([3, 4, 5]));
        assert_eq!(geometry.nearest_voxel(&Point3::new(-5.0, 0.0, 0.0)), None);
        assert_eq!(geometry.nearest_voxel(&Point3::new(1.0, 0.0, 9.6)), None);
    }

    #[test]
    fn test_validate_rejects_zero_dims_and_spacing() {
        assert!(GridGeometry::new([0, 1, 1], [1.0; 3]).validate().is_err());
        assert!(GridGeometry::new([1, 1, 1], [1.0, 0.0, 1.0]).validate().is_err());
        assert!(GridGeometry::new([1, 1, 1], [1.0; 3]).validate().is_ok());
    }

    #[test]
    fn test_query_image_rejects_wrong_length() {
        let geometry = GridGeometry::new([2, 2, 2], [1.0; 3]);
        assert!(QueryImage::new("q", geometry, PixelType::U8, vec![0.0; 7]).is_err());
    }

    #[test]
    fn test_ledger_path_for_image() {
        let path = ledger_path_for(Path::new("/data/brain_42.nrrd"));
        assert_eq!(path, PathBuf::from("/data/brain_42_results.csv"));
    }

    #[test]
    fn test_intensity_range() {
        let geometry = GridGeometry::new([1, 1, 3], [1.0; 3]);
        let image = QueryImage::new("q", geometry, PixelType::U8, vec![5.0, 1.0, 9.0]).unwrap();
        assert_eq!(image.intensity_range(), Some((1.0, 9.0)));
    }
}
