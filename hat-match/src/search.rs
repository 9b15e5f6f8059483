//! Candidate hemilineage search
//!
//! Every hemilineage gets a spherical search zone around its soma centroid.
//! Right-side somas are mirrored across the sagittal midplane and pooled with
//! the left ones; the zone radius is `radius_scale` times the RMS distance of
//! the pooled somas from their centroid.

use crate::atlas::{HemilineageAtlas, SomaPopulation};
use crate::error::{MatchError, Result};
use hat_common::geometry::{centroid, rms_distance};
use hat_common::Point3;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info, warn};

/// Width of the template in x; mirroring maps `x` to `width - x`
pub const DEFAULT_MIRROR_WIDTH_UM: f64 = 627.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Zone radius in units of soma RMS distance
    pub radius_scale: f64,
    pub mirror_width_um: f64,
    /// Also test the mirrored query and keep the closer of the two
    pub mirror_query: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            radius_scale: 3.0,
            mirror_width_um: DEFAULT_MIRROR_WIDTH_UM,
            mirror_query: false,
        }
    }
}

/// Search zone of one hemilineage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HemilineageZone {
    pub hemilineage: String,
    pub centroid: Point3,
    pub rmse: f64,
    pub radius: f64,
    pub somas: usize,
}

/// Hemilineage whose zone contains the query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub hemilineage: String,
    /// Distance compared against the radius
    pub distance: f64,
    pub radius: f64,
    /// The mirrored query was the closer one
    pub mirrored: bool,
}

#[derive(Debug, Clone)]
pub struct CandidateSearch {
    zones: Vec<HemilineageZone>,
    params: SearchParams,
}

impl CandidateSearch {
    /// Zones from soma populations; empty populations are skipped
    pub fn from_populations(populations: &[SomaPopulation], params: SearchParams) -> Self {
        let mut zones = Vec::with_capacity(populations.len());
        for population in populations {
            let pooled: Vec<Point3> = population
                .left
                .iter()
                .copied()
                .chain(population.right.iter().map(|p| p.mirrored(params.mirror_width_um)))
                .filter(Point3::is_finite)
                .collect();
            let Some(center) = centroid(&pooled) else {
                warn!(
                    hemilineage = %population.hemilineage,
                    "Hemilineage has no soma positions, excluded from candidate search"
                );
                continue;
            };
            let rmse = rms_distance(&pooled, &center);
            zones.push(HemilineageZone {
                hemilineage: population.hemilineage.clone(),
                centroid: center,
                rmse,
                radius: params.radius_scale * rmse,
                somas: pooled.len(),
            });
        }
        debug!(zones = zones.len(), "Built candidate search zones");
        Self { zones, params }
    }

    /// Zones with explicit centroids and radii
    pub fn from_zones(zones: Vec<HemilineageZone>, params: SearchParams) -> Self {
        Self { zones, params }
    }

    pub async fn load(atlas: &dyn HemilineageAtlas, params: SearchParams) -> Result<Self> {
        let populations = atlas.soma_populations().await?;
        let search = Self::from_populations(&populations, params);
        info!(
            atlas = %atlas.location(),
            hemilineages = populations.len(),
            zones = search.zones.len(),
            "Candidate search ready"
        );
        Ok(search)
    }

    pub fn zones(&self) -> &[HemilineageZone] {
        &self.zones
    }

    pub fn zone(&self, hemilineage: &str) -> Option<&HemilineageZone> {
        self.zones.iter().find(|z| z.hemilineage == hemilineage)
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    /// Hemilineages whose zone contains `query`, nearest first
    ///
    /// Ties in distance are ordered by name.
    pub fn find_candidates(&self, query: &Point3) -> Result<Vec<Candidate>> {
        if !query.is_finite() {
            return Err(MatchError::InvalidInput(format!(
                "query centroid {} is not finite",
                query
            )));
        }
        let mirrored_query = query.mirrored(self.params.mirror_width_um);

        let mut candidates: Vec<Candidate> = self
            .zones
            .iter()
            .filter_map(|zone| {
                let direct = query.distance(&zone.centroid);
                let (distance, mirrored) = if self.params.mirror_query {
                    let flipped = mirrored_query.distance(&zone.centroid);
                    if flipped < direct {
                        (flipped, true)
                    } else {
                        (direct, false)
                    }
                } else {
                    (direct, false)
                };
                (distance <= zone.radius).then(|| Candidate {
                    hemilineage: zone.hemilineage.clone(),
                    distance,
                    radius: zone.radius,
                    mirrored,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.hemilineage.cmp(&b.hemilineage))
        });
        debug!(query = %query, candidates = candidates.len(), "Candidate search");
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(name: &str, centroid: Point3, radius: f64) -> HemilineageZone {
        HemilineageZone {
            hemilineage: name.to_string(),
            centroid,
            rmse: radius / 3.0,
            radius,
            somas: 1,
        }
    }

    #[test]
    fn test_exact_centroid_is_nearest_candidate() {
        let search = CandidateSearch::from_zones(
            vec![
                zone("far", Point3::new(10.0, 20.0, 33.0), 5.0),
                zone("exact", Point3::new(10.0, 20.0, 30.0), 5.0),
                zone("outside", Point3::new(100.0, 20.0, 30.0), 5.0),
            ],
            SearchParams::default(),
        );
        let found = search.find_candidates(&Point3::new(10.0, 20.0, 30.0)).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].hemilineage, "exact");
        assert_eq!(found[0].distance, 0.0);
        assert_eq!(found[1].hemilineage, "far");
        assert!((found[1].distance - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_radius_boundary_is_inclusive_and_ties_sort_by_name() {
        let search = CandidateSearch::from_zones(
            vec![
                zone("b", Point3::new(0.0, 0.0, 5.0), 5.0),
                zone("a", Point3::new(0.0, 5.0, 0.0), 5.0),
            ],
            SearchParams::default(),
        );
        let found = search.find_candidates(&Point3::default()).unwrap();
        let names: Vec<&str> = found.iter().map(|c| c.hemilineage.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_zone_from_pooled_somas() {
        // Right soma at x=617 mirrors to x=10, pooling with the left soma at x=10
        let populations = vec![SomaPopulation {
            hemilineage: "ALad1".into(),
            left: vec![Point3::new(0.0, 0.0, 10.0), Point3::new(0.0, 2.0, 10.0)],
            right: vec![Point3::new(0.0, 0.0, 617.0), Point3::new(0.0, 2.0, 617.0)],
        }];
        let search = CandidateSearch::from_populations(&populations, SearchParams::default());
        let zone = search.zone("ALad1").unwrap();
        assert_eq!(zone.somas, 4);
        assert_eq!(zone.centroid, Point3::new(0.0, 1.0, 10.0));
        assert!((zone.rmse - 1.0).abs() < 1e-12);
        assert!((zone.radius - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_population_is_skipped() {
        let populations = vec![SomaPopulation {
            hemilineage: "empty".into(),
            left: vec![],
            right: vec![],
        }];
        let search = CandidateSearch::from_populations(&populations, SearchParams::default());
        assert!(search.zones().is_empty());
        assert!(search.find_candidates(&Point3::default()).unwrap().is_empty());
    }

    #[test]
    fn test_mirror_query_uses_closer_side() {
        let zones = vec![zone("left", Point3::new(0.0, 0.0, 27.0), 5.0)];
        let query = Point3::new(0.0, 0.0, 600.0);

        let plain = CandidateSearch::from_zones(zones.clone(), SearchParams::default());
        assert!(plain.find_candidates(&query).unwrap().is_empty());

        let params = SearchParams {
            mirror_query: true,
            ..Default::default()
        };
        let mirrored = CandidateSearch::from_zones(zones, params);
        let found = mirrored.find_candidates(&query).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].mirrored);
        assert!(found[0].distance.abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_query_rejected() {
        let search = CandidateSearch::from_zones(vec![], SearchParams::default());
        assert!(search.find_candidates(&Point3::new(f64::NAN, 0.0, 0.0)).is_err());
    }
}
