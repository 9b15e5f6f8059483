//! Template-space geometry
//!
//! All coordinates are physical positions in microns in the shared template
//! space, stored in `(z, y, x)` order to match the voxel grid layout.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A point in template space, `(z, y, x)` in microns
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub z: f64,
    pub y: f64,
    pub x: f64,
}

impl Point3 {
    pub const fn new(z: f64, y: f64, x: f64) -> Self {
        Self { z, y, x }
    }

    pub fn from_array(zyx: [f64; 3]) -> Self {
        Self::new(zyx[0], zyx[1], zyx[2])
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.z, self.y, self.x]
    }

    /// Euclidean distance in microns
    pub fn distance(&self, other: &Point3) -> f64 {
        self.distance_squared(other).sqrt()
    }

    pub fn distance_squared(&self, other: &Point3) -> f64 {
        let dz = self.z - other.z;
        let dy = self.y - other.y;
        let dx = self.x - other.x;
        dz * dz + dy * dy + dx * dx
    }

    /// Mirror across the sagittal midplane of a template `width_um` wide.
    ///
    /// The midplane sits at `x = width_um / 2`, so `x' = width_um - x`.
    pub fn mirrored(&self, width_um: f64) -> Point3 {
        Point3::new(self.z, self.y, width_um - self.x)
    }

    pub fn is_finite(&self) -> bool {
        self.z.is_finite() && self.y.is_finite() && self.x.is_finite()
    }

    /// Bitwise identity, used when points act as ledger keys
    pub fn same_bits(&self, other: &Point3) -> bool {
        self.z.to_bits() == other.z.to_bits()
            && self.y.to_bits() == other.y.to_bits()
            && self.x.to_bits() == other.x.to_bits()
    }
}

/// Mean position of a set of points, `None` for an empty set
pub fn centroid(points: &[Point3]) -> Option<Point3> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (z, y, x) = points
        .iter()
        .fold((0.0, 0.0, 0.0), |(z, y, x), p| (z + p.z, y + p.y, x + p.x));
    Some(Point3::new(z / n, y / n, x / n))
}

/// Root-mean-square distance of `points` from `center`
pub fn rms_distance(points: &[Point3], center: &Point3) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let sum: f64 = points.iter().map(|p| p.distance_squared(center)).sum();
    (sum / points.len() as f64).sqrt()
}

/// Formats as `(z, y, x)` with shortest round-trip float representation
impl fmt::Display for Point3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}, {:?}, {:?})", self.z, self.y, self.x)
    }
}

/// Parses `(z, y, x)`; the parentheses are optional
impl FromStr for Point3 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let inner = s
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')');
        let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(Error::Parse(format!(
                "expected three comma-separated coordinates, got '{}'",
                s
            )));
        }

        let mut coords = [0.0f64; 3];
        for (slot, part) in coords.iter_mut().zip(&parts) {
            *slot = part
                .parse::<f64>()
                .map_err(|e| Error::Parse(format!("invalid coordinate '{}': {}", part, e)))?;
        }
        Ok(Point3::from_array(coords))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_round_trips() {
        let p = Point3::new(10.0, 20.5, 0.1 + 0.2);
        let text = p.to_string();
        assert_eq!(text, "(10.0, 20.5, 0.30000000000000004)");
        let parsed: Point3 = text.parse().unwrap();
        assert!(parsed.same_bits(&p));
    }

    #[test]
    fn test_parse_without_parentheses() {
        let p: Point3 = " 1, 2.5 ,-3 ".parse().unwrap();
        assert_eq!(p, Point3::new(1.0, 2.5, -3.0));
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        assert!("(1.0, 2.0)".parse::<Point3>().is_err());
        assert!("(1.0, 2.0, abc)".parse::<Point3>().is_err());
    }

    #[test]
    fn test_mirror_is_involution() {
        let p = Point3::new(5.0, 6.0, 100.0);
        let m = p.mirrored(627.0);
        assert_eq!(m.x, 527.0);
        assert_eq!(m.mirrored(627.0), p);
    }

    #[test]
    fn test_centroid_and_rms() {
        let pts = [Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 0.0, 0.0)];
        let c = centroid(&pts).unwrap();
        assert_eq!(c, Point3::new(1.0, 0.0, 0.0));
        assert!((rms_distance(&pts, &c) - 1.0).abs() < 1e-12);
        assert!(centroid(&[]).is_none());
    }
}
