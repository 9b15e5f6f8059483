//! Synthetic query images and hemilineages
//!
//! The query image holds one bright neurite running along x at
//! `z = 6, y = 6`. Hemilineage `H<i>` (i = 1..=5) has its soma centroid
//! `i - 1` microns from [`QUERY_CENTROID`] and a search radius of 6 microns,
//! so all five are candidates, nearest first in name order.

use hat_common::Point3;
use hat_match::scoring::Dotprops;
use hat_match::volume::{BinaryMask, GridGeometry, PixelType, QueryImage, SparseMask};
use std::path::Path;

use super::memory_atlas::MemoryAtlas;

pub const DIMS: [usize; 3] = [12, 12, 40];
pub const NEURITE_X: std::ops::Range<usize> = 5..35;
pub const QUERY_CENTROID: Point3 = Point3::new(6.0, 6.0, 20.0);

pub fn grid() -> GridGeometry {
    GridGeometry::new(DIMS, [1.0, 1.0, 1.0])
}

/// Query image with a neurite of intensity 200 on a background of 10
pub fn query_image(dir: &Path) -> QueryImage {
    let geometry = grid();
    let mut data = vec![10.0f32; geometry.len()];
    for x in NEURITE_X {
        data[geometry.linear_index([6, 6, x])] = 200.0;
    }
    QueryImage::new("brain", geometry, PixelType::U8, data)
        .unwrap()
        .with_source(dir.join("brain.nrrd"))
}

/// [`query_image`] plus isolated bright voxels in three corners
pub fn speckled_query_image(dir: &Path) -> QueryImage {
    let clean = query_image(dir);
    let geometry = *clean.geometry();
    let mut data = clean.data().to_vec();
    for corner in [[0, 0, 0], [11, 11, 39], [0, 11, 39]] {
        data[geometry.linear_index(corner)] = 200.0;
    }
    QueryImage::new("brain", geometry, PixelType::U8, data)
        .unwrap()
        .with_source(dir.join("brain.nrrd"))
}

/// Uniform image, every voxel at `value`
pub fn uniform_image(value: f32) -> QueryImage {
    let geometry = grid();
    QueryImage::new("uniform", geometry, PixelType::U8, vec![value; geometry.len()]).unwrap()
}

/// Line along x at `(z, y)` over `xs`, as a sparse mask
pub fn line_mask(z: usize, y: usize, xs: std::ops::Range<usize>) -> SparseMask {
    let mut mask = BinaryMask::empty(grid());
    for x in xs {
        mask.set([z, y, x], true);
    }
    mask.to_sparse()
}

pub fn line_skeleton(z: f64, y: f64, xs: std::ops::Range<usize>) -> Dotprops {
    let points = xs.map(|x| Point3::new(z, y, x as f64)).collect();
    Dotprops::from_points(points, 5).unwrap()
}

pub fn hemilineage_names() -> Vec<String> {
    (1..=5).map(|i| format!("H{}", i)).collect()
}

/// Five hemilineages around [`QUERY_CENTROID`]
pub fn five_hemilineage_atlas() -> MemoryAtlas {
    let mut atlas = MemoryAtlas::new();
    for i in 1..=5usize {
        let center = Point3::new(6.0, 6.0, 20.0 + (i - 1) as f64);
        let left = vec![
            Point3::new(center.z, center.y, center.x - 2.0),
            Point3::new(center.z, center.y, center.x + 2.0),
        ];
        // H1 matches the query neurite exactly, the others sit further away
        let offset = i - 1;
        atlas = atlas.with_hemilineage(
            &format!("H{}", i),
            left,
            vec![],
            line_mask(6, 6 + offset, NEURITE_X),
            line_skeleton(6.0, (6 + offset) as f64, NEURITE_X),
        );
    }
    atlas
}
