//! Binary voxel overlap

use crate::volume::{BinaryMask, SparseMask};

/// Fraction of the tract mask covered by the query mask, `|Q ∩ T| / |T|`
///
/// On the query grid this is a lookup per tract index. A tract on a
/// different grid is resampled onto the query grid first.
/// Returns `None` when the tract has no voxels on the query grid.
pub fn voxel_overlap(query: &BinaryMask, tract: &SparseMask) -> Option<f64> {
    let resampled;
    let tract = if tract.geometry().same_grid(query.geometry()) {
        tract
    } else {
        resampled = tract.to_dense().resample_to(query.geometry()).to_sparse();
        &resampled
    };

    if tract.is_empty() {
        return None;
    }
    Some(tract.count_in(query) as f64 / tract.len() as f64)
}
