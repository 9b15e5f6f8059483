//! SQLite-backed atlas
//!
//! `SqliteAtlas` opens an existing atlas file read-only. `AtlasBuilder`
//! creates or extends one and is used by fixtures and conversion tooling.

use super::schema::{self, FORMAT_VERSION};
use super::{AtlasValidation, HemilineageAtlas, MaskKind, SomaPopulation, SomaSide};
use crate::error::{MatchError, Result};
use crate::scoring::Dotprops;
use crate::volume::{GridGeometry, SparseMask};
use async_trait::async_trait;
use hat_common::Point3;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

type MaskRow = (i64, i64, i64, f64, f64, f64, f64, f64, f64, Vec<u8>);

fn lookup_error(e: sqlx::Error) -> MatchError {
    MatchError::Atlas(e.to_string())
}

/// Read-only connection to an atlas file
pub struct SqliteAtlas {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteAtlas {
    /// Open and verify an atlas file
    ///
    /// Fails with `MatchError::Connection` if the file is missing, cannot be
    /// opened, or does not carry a supported atlas format version.
    pub async fn connect(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(MatchError::Connection(format!(
                "atlas file not found: {}",
                path.display()
            )));
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(path)
                    .read_only(true)
                    .create_if_missing(false),
            )
            .await
            .map_err(|e| MatchError::Connection(format!("{}: {}", path.display(), e)))?;

        let version: Option<(String,)> =
            sqlx::query_as("SELECT value FROM atlas_info WHERE key = 'format_version'")
                .fetch_optional(&pool)
                .await
                .map_err(|e| {
                    MatchError::Connection(format!(
                        "{} is not a hemilineage atlas: {}",
                        path.display(),
                        e
                    ))
                })?;

        match version {
            Some((v,)) if v == FORMAT_VERSION => {}
            Some((v,)) => {
                pool.close().await;
                return Err(MatchError::Connection(format!(
                    "{} has unsupported atlas format version {}",
                    path.display(),
                    v
                )));
            }
            None => {
                pool.close().await;
                return Err(MatchError::Connection(format!(
                    "{} has no atlas format version",
                    path.display()
                )));
            }
        }

        info!(path = %path.display(), "Connected to hemilineage atlas");
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn require_hemilineage(&self, name: &str) -> Result<()> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT name FROM hemilineages WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(lookup_error)?;
        match exists {
            Some(_) => Ok(()),
            None => Err(MatchError::NotFound(format!("hemilineage '{}'", name))),
        }
    }
}

#[async_trait]
impl HemilineageAtlas for SqliteAtlas {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn hemilineages(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM hemilineages ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(lookup_error)?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn soma_populations(&self) -> Result<Vec<SomaPopulation>> {
        let mut populations: BTreeMap<String, SomaPopulation> = self
            .hemilineages()
            .await?
            .into_iter()
            .map(|name| {
                let population = SomaPopulation {
                    hemilineage: name.clone(),
                    left: Vec::new(),
                    right: Vec::new(),
                };
                (name, population)
            })
            .collect();

        let rows: Vec<(String, String, f64, f64, f64)> =
            sqlx::query_as("SELECT hemilineage, side, z, y, x FROM somas ORDER BY hemilineage, id")
                .fetch_all(&self.pool)
                .await
                .map_err(lookup_error)?;

        for (name, side, z, y, x) in rows {
            let Some(population) = populations.get_mut(&name) else {
                warn!(hemilineage = %name, "Soma row for unknown hemilineage ignored");
                continue;
            };
            let point = Point3::new(z, y, x);
            match side.as_str() {
                "left" => population.left.push(point),
                "right" => population.right.push(point),
                other => warn!(hemilineage = %name, side = %other, "Soma row with unknown side ignored"),
            }
        }

        Ok(populations.into_values().collect())
    }

    async fn mask(&self, hemilineage: &str, kind: MaskKind) -> Result<SparseMask> {
        let row: Option<MaskRow> = sqlx::query_as(
            r#"
            SELECT dim_z, dim_y, dim_x, spacing_z, spacing_y, spacing_x,
                   origin_z, origin_y, origin_x, voxels
            FROM masks
            WHERE hemilineage = ? AND kind = ?
            "#,
        )
        .bind(hemilineage)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(lookup_error)?;

        let Some((dz, dy, dx, sz, sy, sx, oz, oy, ox, voxels)) = row else {
            self.require_hemilineage(hemilineage).await?;
            return Err(MatchError::NotFound(format!("{} mask for '{}'", kind, hemilineage)));
        };

        let dim = |d: i64| {
            usize::try_from(d).map_err(|_| MatchError::Atlas(format!("negative mask dimension {}", d)))
        };
        let geometry = GridGeometry::new([dim(dz)?, dim(dy)?, dim(dx)?], [sz, sy, sx]).with_origin([oz, oy, ox]);
        let mask = SparseMask::from_bytes(geometry, &voxels)
            .map_err(|e| MatchError::Atlas(format!("{} mask for '{}': {}", kind, hemilineage, e)))?;
        debug!(hemilineage, kind = %kind, voxels = mask.len(), "Loaded atlas mask");
        Ok(mask)
    }

    async fn skeleton(&self, hemilineage: &str) -> Result<Dotprops> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT data FROM skeletons WHERE hemilineage = ?")
            .bind(hemilineage)
            .fetch_optional(&self.pool)
            .await
            .map_err(lookup_error)?;

        let Some((data,)) = row else {
            self.require_hemilineage(hemilineage).await?;
            return Err(MatchError::NotFound(format!("skeleton for '{}'", hemilineage)));
        };
        Dotprops::from_bytes(&data)
            .map_err(|e| MatchError::Atlas(format!("skeleton for '{}': {}", hemilineage, e)))
    }

    async fn validate(&self, expected: Option<usize>) -> Result<AtlasValidation> {
        let names = self.hemilineages().await?;
        let missing_tracts: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT name FROM hemilineages h
            WHERE NOT EXISTS (
                SELECT 1 FROM masks m
                WHERE m.hemilineage = h.name AND m.kind = 'tract' AND length(m.voxels) > 0
            )
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(lookup_error)?;

        let missing_skeletons: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT name FROM hemilineages h
            WHERE NOT EXISTS (
                SELECT 1 FROM skeletons s
                WHERE s.hemilineage = h.name AND s.samples > 0
            )
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(lookup_error)?;

        let report = AtlasValidation {
            hemilineages: names.len(),
            expected,
            missing_tracts: missing_tracts.into_iter().map(|(n,)| n).collect(),
            missing_skeletons: missing_skeletons.into_iter().map(|(n,)| n).collect(),
        };
        if !report.is_valid() {
            warn!(
                path = %self.path.display(),
                hemilineages = report.hemilineages,
                expected = ?report.expected,
                missing_tracts = report.missing_tracts.len(),
                missing_skeletons = report.missing_skeletons.len(),
                "Atlas validation found problems"
            );
        }
        Ok(report)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!(path = %self.path.display(), "Closed hemilineage atlas");
    }
}

/// Writer for atlas files
pub struct AtlasBuilder {
    pool: SqlitePool,
    path: PathBuf,
}

impl AtlasBuilder {
    /// Create (or open for extension) an atlas file with the full schema
    pub async fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .foreign_keys(true),
            )
            .await
            .map_err(|e| MatchError::Connection(format!("{}: {}", path.display(), e)))?;
        schema::create_all(&pool).await.map_err(lookup_error)?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub async fn set_info(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO atlas_info (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(lookup_error)?;
        Ok(())
    }

    pub async fn add_hemilineage(&self, name: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO hemilineages (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(lookup_error)?;
        Ok(())
    }

    pub async fn add_somas(&self, hemilineage: &str, side: SomaSide, points: &[Point3]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(lookup_error)?;
        for p in points {
            sqlx::query("INSERT INTO somas (hemilineage, side, z, y, x) VALUES (?, ?, ?, ?, ?)")
                .bind(hemilineage)
                .bind(side.as_str())
                .bind(p.z)
                .bind(p.y)
                .bind(p.x)
                .execute(&mut *tx)
                .await
                .map_err(lookup_error)?;
        }
        tx.commit().await.map_err(lookup_error)?;
        Ok(())
    }

    pub async fn add_mask(&self, hemilineage: &str, kind: MaskKind, mask: &SparseMask) -> Result<()> {
        let g = mask.geometry();
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO masks (
                hemilineage, kind, dim_z, dim_y, dim_x, spacing_z, spacing_y, spacing_x,
                origin_z, origin_y, origin_x, voxels
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(hemilineage)
        .bind(kind.as_str())
        .bind(g.dims[0] as i64)
        .bind(g.dims[1] as i64)
        .bind(g.dims[2] as i64)
        .bind(g.spacing[0])
        .bind(g.spacing[1])
        .bind(g.spacing[2])
        .bind(g.origin[0])
        .bind(g.origin[1])
        .bind(g.origin[2])
        .bind(mask.to_bytes())
        .execute(&self.pool)
        .await
        .map_err(lookup_error)?;
        Ok(())
    }

    pub async fn add_skeleton(&self, hemilineage: &str, skeleton: &Dotprops) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO skeletons (hemilineage, samples, data) VALUES (?, ?, ?)")
            .bind(hemilineage)
            .bind(skeleton.len() as i64)
            .bind(skeleton.to_bytes())
            .execute(&self.pool)
            .await
            .map_err(lookup_error)?;
        Ok(())
    }

    /// Flush and close; returns the atlas path
    pub async fn finish(self) -> PathBuf {
        self.pool.close().await;
        debug!(path = %self.path.display(), "Atlas written");
        self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn line_skeleton() -> Dotprops {
        let points = (0..5).map(|i| Point3::new(0.0, 0.0, i as f64)).collect();
        Dotprops::from_points(points, 3).unwrap()
    }

    async fn build_fixture(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("atlas.db");
        let builder = AtlasBuilder::create(&path).await.unwrap();
        let geometry = GridGeometry::new([4, 4, 4], [1.0; 3]);
        for name in ["ALad1", "DM1_CX_d"] {
            builder.add_hemilineage(name).await.unwrap();
        }
        builder
            .add_somas("ALad1", SomaSide::Left, &[Point3::new(1.0, 2.0, 3.0)])
            .await
            .unwrap();
        builder
            .add_somas("ALad1", SomaSide::Right, &[Point3::new(1.0, 2.0, 600.0)])
            .await
            .unwrap();
        let tract = SparseMask::new(geometry, vec![0, 5, 63]).unwrap();
        builder.add_mask("ALad1", MaskKind::Tract, &tract).await.unwrap();
        builder.add_mask("DM1_CX_d", MaskKind::Tract, &tract).await.unwrap();
        builder.add_skeleton("ALad1", &line_skeleton()).await.unwrap();
        builder.finish().await
    }

    #[tokio::test]
    async fn test_round_trip_through_builder() {
        let dir = TempDir::new().unwrap();
        let path = build_fixture(&dir).await;
        let atlas = SqliteAtlas::connect(&path).await.unwrap();

        assert_eq!(atlas.hemilineages().await.unwrap(), vec!["ALad1", "DM1_CX_d"]);

        let populations = atlas.soma_populations().await.unwrap();
        assert_eq!(populations.len(), 2);
        assert_eq!(populations[0].left, vec![Point3::new(1.0, 2.0, 3.0)]);
        assert_eq!(populations[0].right, vec![Point3::new(1.0, 2.0, 600.0)]);
        assert!(populations[1].is_empty());

        let tract = atlas.mask("ALad1", MaskKind::Tract).await.unwrap();
        assert_eq!(tract.indices(), &[0, 5, 63]);
        assert_eq!(tract.geometry().dims, [4, 4, 4]);

        assert_eq!(atlas.skeleton("ALad1").await.unwrap(), line_skeleton());
        atlas.close().await;
    }

    #[tokio::test]
    async fn test_missing_entries_are_not_found() {
        let dir = TempDir::new().unwrap();
        let path = build_fixture(&dir).await;
        let atlas = SqliteAtlas::connect(&path).await.unwrap();

        assert!(matches!(
            atlas.mask("ALad1", MaskKind::WholeNeuron).await,
            Err(MatchError::NotFound(_))
        ));
        assert!(matches!(atlas.skeleton("DM1_CX_d").await, Err(MatchError::NotFound(_))));
        assert!(matches!(
            atlas.mask("nope", MaskKind::Tract).await,
            Err(MatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_reports_missing_skeleton() {
        let dir = TempDir::new().unwrap();
        let path = build_fixture(&dir).await;
        let atlas = SqliteAtlas::connect(&path).await.unwrap();

        let report = atlas.validate(Some(2)).await.unwrap();
        assert_eq!(report.hemilineages, 2);
        assert!(report.missing_tracts.is_empty());
        assert_eq!(report.missing_skeletons, vec!["DM1_CX_d"]);
        assert!(!report.is_valid());
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        let missing = SqliteAtlas::connect(&dir.path().join("none.db")).await;
        assert!(matches!(missing, Err(MatchError::Connection(_))));

        let other = dir.path().join("other.db");
        let pool = SqlitePoolOptions::new()
            .connect_with(SqliteConnectOptions::new().filename(&other).create_if_missing(true))
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (x INTEGER)").execute(&pool).await.unwrap();
        pool.close().await;
        assert!(matches!(
            SqliteAtlas::connect(&other).await,
            Err(MatchError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let path = build_fixture(&dir).await;
        let atlas = SqliteAtlas::connect(&path).await.unwrap();
        atlas.close().await;
        assert!(matches!(atlas.hemilineages().await, Err(MatchError::Atlas(_))));
    }
}
