//! Query image thresholding
//!
//! Otsu's method picks the intensity that maximizes the inter-class variance
//! of a 256-bin histogram spanning the image's own intensity range. The
//! binary mask keeps voxels at or above the threshold.

use crate::error::{MatchError, Result};
use crate::volume::{BinaryMask, PixelType, QueryImage};
use tracing::debug;

const NUM_BINS: usize = 256;

/// Automatic threshold for an image
///
/// Returns the centre of the optimal histogram bin. A constant image
/// returns its constant value.
pub fn compute_threshold(image: &QueryImage) -> Result<f64> {
    let (min, max) = image.intensity_range().ok_or_else(|| {
        MatchError::DegenerateInput(format!("image '{}' has no finite samples", image.name()))
    })?;
    let (min, max) = (min as f64, max as f64);
    if max <= min {
        return Ok(min);
    }

    let width = (max - min) / NUM_BINS as f64;
    let mut histogram = [0u64; NUM_BINS];
    for &v in image.data().iter().filter(|v| v.is_finite()) {
        let bin = (((v as f64 - min) / width) as usize).min(NUM_BINS - 1);
        histogram[bin] += 1;
    }
    let centre = |bin: usize| min + (bin as f64 + 0.5) * width;

    let total: f64 = histogram.iter().map(|&c| c as f64).sum();
    let total_mass: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &c)| c as f64 * centre(i))
        .sum();

    // Class 0 is bins 0..=t, class 1 the rest
    let mut weight0 = 0.0;
    let mut mass0 = 0.0;
    let mut best_bin = 0usize;
    let mut best_variance = f64::NEG_INFINITY;
    for (t, &count) in histogram.iter().enumerate().take(NUM_BINS - 1) {
        weight0 += count as f64;
        mass0 += count as f64 * centre(t);
        let weight1 = total - weight0;
        if weight0 == 0.0 || weight1 == 0.0 {
            continue;
        }
        let mean0 = mass0 / weight0;
        let mean1 = (total_mass - mass0) / weight1;
        let variance = weight0 * weight1 * (mean0 - mean1).powi(2);
        if variance > best_variance {
            best_variance = variance;
            best_bin = t;
        }
    }

    let threshold = centre(best_bin);
    debug!(
        image = %image.name(),
        min,
        max,
        threshold,
        "Computed Otsu threshold"
    );
    Ok(threshold)
}

/// Binarize: foreground iff `intensity >= value`
pub fn apply(image: &QueryImage, value: f64) -> BinaryMask {
    let voxels = image.data().iter().map(|&v| v as f64 >= value).collect();
    BinaryMask::from_parts(*image.geometry(), voxels).with_threshold(value)
}

/// Check a user-supplied threshold against the image's native range
pub fn validate_manual(image: &QueryImage, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(MatchError::InvalidInput(format!(
            "threshold must be a finite number, got {}",
            value
        )));
    }
    let (lo, hi) = match image.pixel_type().native_range() {
        Some(range) => range,
        None => image
            .intensity_range()
            .map(|(lo, hi)| (lo as f64, hi as f64))
            .ok_or_else(|| {
                MatchError::DegenerateInput(format!("image '{}' has no finite samples", image.name()))
            })?,
    };
    if value < lo || value > hi {
        let kind = match image.pixel_type() {
            PixelType::F32 => "image intensity range".to_string(),
            other => format!("{:?} range", other),
        };
        return Err(MatchError::InvalidInput(format!(
            "threshold {} outside the {} [{}, {}]",
            value, kind, lo, hi
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::GridGeometry;

    fn image(pixel_type: PixelType, data: Vec<f32>) -> QueryImage {
        let geometry = GridGeometry::new([1, 1, data.len()], [1.0; 3]);
        QueryImage::new("q", geometry, pixel_type, data).unwrap()
    }

    #[test]
    fn test_constant_image_returns_constant() {
        let img = image(PixelType::U8, vec![200.0; 27]);
        assert_eq!(compute_threshold(&img).unwrap(), 200.0);
        assert_eq!(apply(&img, 200.0).count(), 27);
    }

    #[test]
    fn test_bimodal_image_splits_classes() {
        let mut data = vec![10.0; 60];
        data.extend(vec![200.0; 40]);
        let img = image(PixelType::U8, data);
        let t = compute_threshold(&img).unwrap();
        assert!(t > 10.0 && t < 200.0, "threshold {} not between modes", t);
        let mask = apply(&img, t);
        assert_eq!(mask.count(), 40);
        assert_eq!(mask.threshold(), Some(t));
    }

    #[test]
    fn test_three_level_image_separates_dark_class() {
        let mut data = vec![0.0; 50];
        data.extend(vec![100.0; 25]);
        data.extend(vec![110.0; 25]);
        let img = image(PixelType::U8, data);
        let t = compute_threshold(&img).unwrap();
        assert!(t > 0.0 && t <= 100.0);
        assert_eq!(apply(&img, t).count(), 50);
    }

    #[test]
    fn test_uniform_image_above_manual_threshold_is_all_foreground() {
        let img = image(PixelType::U8, vec![200.0; 8]);
        validate_manual(&img, 128.0).unwrap();
        let mask = apply(&img, 128.0);
        assert_eq!(mask.count(), 8);
    }

    #[test]
    fn test_threshold_equal_to_intensity_is_foreground() {
        let img = image(PixelType::U16, vec![5.0, 6.0, 7.0]);
        assert_eq!(apply(&img, 6.0).voxels(), &[false, true, true]);
    }

    #[test]
    fn test_validate_manual_ranges() {
        let u8_img = image(PixelType::U8, vec![0.0, 10.0]);
        assert!(validate_manual(&u8_img, 255.0).is_ok());
        assert!(validate_manual(&u8_img, 256.0).is_err());
        assert!(validate_manual(&u8_img, -1.0).is_err());
        assert!(validate_manual(&u8_img, f64::NAN).is_err());

        let u16_img = image(PixelType::U16, vec![0.0]);
        assert!(validate_manual(&u16_img, 65535.0).is_ok());

        let f32_img = image(PixelType::F32, vec![-0.5, 2.5]);
        assert!(validate_manual(&f32_img, 1.0).is_ok());
        assert!(validate_manual(&f32_img, 3.0).is_err());
    }
}
