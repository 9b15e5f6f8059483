//! SQLite atlas end-to-end tests

mod helpers;

use hat_common::Point3;
use hat_match::atlas::{AtlasBuilder, HemilineageAtlas, MaskKind, SomaSide};
use hat_match::config::{MatchConfig, ATLAS_ENV_VAR};
use hat_match::{MatchError, ProofreadingSession, ScoringMethods, SessionConfig, SessionState, SqliteAtlas};
use helpers::*;
use serial_test::serial;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Same hemilineages as the in-memory fixture, written to a SQLite file
async fn write_atlas(path: &Path) -> PathBuf {
    let builder = AtlasBuilder::create(path).await.unwrap();
    builder.set_info("template", "JRC2018U").await.unwrap();
    for i in 1..=5usize {
        let name = format!("H{}", i);
        let x = 20.0 + (i - 1) as f64;
        builder.add_hemilineage(&name).await.unwrap();
        builder
            .add_somas(&name, SomaSide::Left, &[Point3::new(6.0, 6.0, x - 2.0)])
            .await
            .unwrap();
        // Right soma mirrors onto x + 2
        builder
            .add_somas(&name, SomaSide::Right, &[Point3::new(6.0, 6.0, 627.0 - (x + 2.0))])
            .await
            .unwrap();
        builder
            .add_mask(&name, MaskKind::Tract, &line_mask(6, 6 + i - 1, 5..35))
            .await
            .unwrap();
        builder
            .add_skeleton(&name, &line_skeleton(6.0, (6 + i - 1) as f64, 5..35))
            .await
            .unwrap();
    }
    builder.finish().await
}

#[tokio::test]
async fn test_sqlite_atlas_drives_a_full_cycle() {
    let dir = TempDir::new().unwrap();
    let atlas_path = write_atlas(&dir.path().join("atlas.db")).await;

    let mut session = ProofreadingSession::new(SessionConfig::default());
    session.connect(&atlas_path).await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.hemilineages().len(), 5);

    let zone = session.candidate_search().unwrap().zone("H1").unwrap();
    assert_eq!(zone.somas, 2);
    assert!((zone.radius - 6.0).abs() < 1e-9);

    session.load_image(query_image(dir.path())).unwrap();
    session.auto_threshold().unwrap();
    session.open_ledger().unwrap();
    let cycle = session.select_centroid(QUERY_CENTROID).unwrap();
    assert_eq!(cycle.targets, hemilineage_names());

    let job = session.start_scoring(ScoringMethods::default()).unwrap();
    let report = session.complete_scoring(job).await.unwrap();
    assert_eq!(report.scores.len(), 5);
    assert_eq!(report.failure_count(), 0);
    assert_eq!(report.scores[0].voxel_score, Some(1.0));

    let validation = session.validate_atlas().await.unwrap();
    assert!(validation.is_valid());
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_connect_failure_keeps_state() {
    let dir = TempDir::new().unwrap();
    let mut session = ProofreadingSession::new(SessionConfig::default());
    let err = session.connect(&dir.path().join("missing.db")).await.unwrap_err();
    assert!(matches!(err, MatchError::Connection(_)));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_validation_reports_expected_count() {
    let dir = TempDir::new().unwrap();
    let atlas_path = write_atlas(&dir.path().join("atlas.db")).await;
    let atlas = SqliteAtlas::connect(&atlas_path).await.unwrap();

    let report = atlas.validate(Some(142)).await.unwrap();
    assert_eq!(report.hemilineages, 5);
    assert!(!report.is_valid());
    assert!(report.missing_tracts.is_empty());
    atlas.close().await;
}

#[test]
#[serial]
fn test_atlas_path_resolution_order() {
    let config = MatchConfig {
        atlas: hat_match::config::AtlasConfig {
            atlas_path: Some(PathBuf::from("/from/toml.db")),
            ..Default::default()
        },
        ..Default::default()
    };

    std::env::remove_var(ATLAS_ENV_VAR);
    assert_eq!(
        config.resolve_atlas_path(None),
        Some(PathBuf::from("/from/toml.db"))
    );

    std::env::set_var(ATLAS_ENV_VAR, "/from/env.db");
    assert_eq!(config.resolve_atlas_path(None), Some(PathBuf::from("/from/env.db")));
    assert_eq!(
        config.resolve_atlas_path(Some(Path::new("/from/cli.db"))),
        Some(PathBuf::from("/from/cli.db"))
    );
    std::env::remove_var(ATLAS_ENV_VAR);
}
