//! Point selection text, e.g. `"1,2,3"`, `"1-5"`, `"2, 4-6"` or `"All"`
//!
//! Indices in the text are 1-based and ranges are inclusive. Blank text and
//! `All` select every point.

use crate::error::{MatchError, Result};
use hat_common::geometry::centroid;
use hat_common::Point3;

/// Parse a selection against `n` points into 0-based indices
///
/// Indices keep the order they were written in; repeats are dropped.
pub fn parse_point_selection(text: &str, n: usize) -> Result<Vec<usize>> {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("all") {
        return Ok((0..n).collect());
    }

    let mut indices = Vec::new();
    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => (parse_index(a, part)?, parse_index(b, part)?),
            None => {
                let i = parse_index(part, part)?;
                (i, i)
            }
        };
        if start > end {
            return Err(MatchError::InvalidInput(format!("descending range '{}'", part)));
        }
        if end > n {
            return Err(MatchError::InvalidInput(format!(
                "point {} is out of range, only {} points placed",
                end, n
            )));
        }
        for one_based in start..=end {
            let index = one_based - 1;
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
    }
    Ok(indices)
}

fn parse_index(text: &str, part: &str) -> Result<usize> {
    let value: usize = text
        .trim()
        .parse()
        .map_err(|_| MatchError::InvalidInput(format!("invalid point index in '{}'", part)))?;
    if value == 0 {
        return Err(MatchError::InvalidInput(format!(
            "point indices start at 1, got '{}'",
            part
        )));
    }
    Ok(value)
}

/// Mean of the selected points
pub fn selection_centroid(points: &[Point3], indices: &[usize]) -> Result<Point3> {
    let selected: Vec<Point3> = indices
        .iter()
        .map(|&i| {
            points.get(i).copied().ok_or_else(|| {
                MatchError::InvalidInput(format!("point index {} out of range", i + 1))
            })
        })
        .collect::<Result<_>>()?;
    let center = centroid(&selected)
        .ok_or_else(|| MatchError::DegenerateInput("no points selected".to_string()))?;
    if !center.is_finite() {
        return Err(MatchError::DegenerateInput(format!(
            "selected points give a non-finite centroid {}",
            center
        )));
    }
    Ok(center)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_and_blank_select_everything() {
        assert_eq!(parse_point_selection("All", 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_point_selection(" all ", 2).unwrap(), vec![0, 1]);
        assert_eq!(parse_point_selection("", 2).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_lists_and_ranges() {
        assert_eq!(parse_point_selection("1,2,3", 5).unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_point_selection("1-5", 5).unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(parse_point_selection("4, 1-2, 2", 5).unwrap(), vec![3, 0, 1]);
    }

    #[test]
    fn test_invalid_selections() {
        assert!(parse_point_selection("0", 5).is_err());
        assert!(parse_point_selection("6", 5).is_err());
        assert!(parse_point_selection("3-1", 5).is_err());
        assert!(parse_point_selection("a,b", 5).is_err());
    }

    #[test]
    fn test_selection_centroid() {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 4.0, 6.0),
            Point3::new(100.0, 100.0, 100.0),
        ];
        let c = selection_centroid(&points, &[0, 1]).unwrap();
        assert_eq!(c, Point3::new(1.0, 2.0, 3.0));
        assert!(matches!(
            selection_centroid(&points, &[]),
            Err(MatchError::DegenerateInput(_))
        ));
    }
}
