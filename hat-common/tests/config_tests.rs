//! Tests for config file resolution and graceful degradation
//!
//! Tests that manipulate environment variables are marked with #[serial]
//! so they never run in parallel with each other.

use hat_common::config::{load_toml, resolve_path, save_toml, ConfigLocator};
use serde::{Deserialize, Serialize};
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct SampleConfig {
    #[serde(default)]
    atlas_path: Option<PathBuf>,
    #[serde(default)]
    level: String,
}

#[test]
#[serial]
fn test_locator_cli_argument_wins() {
    env::set_var("HAT_TEST_CONFIG", "/tmp/from-env.toml");
    let locator = ConfigLocator::new("hat-test", "HAT_TEST_CONFIG");

    let path = locator.locate(Some(Path::new("/tmp/from-cli.toml"))).unwrap();
    assert_eq!(path, PathBuf::from("/tmp/from-cli.toml"));

    env::remove_var("HAT_TEST_CONFIG");
}

#[test]
#[serial]
fn test_locator_env_var_before_default() {
    env::set_var("HAT_TEST_CONFIG", "/tmp/from-env.toml");
    let locator = ConfigLocator::new("hat-test", "HAT_TEST_CONFIG");

    let path = locator.locate(None).unwrap();
    assert_eq!(path, PathBuf::from("/tmp/from-env.toml"));

    env::remove_var("HAT_TEST_CONFIG");
}

#[test]
#[serial]
fn test_locator_default_is_under_app_dir() {
    env::remove_var("HAT_TEST_CONFIG");
    let locator = ConfigLocator::new("hat-test", "HAT_TEST_CONFIG");

    if let Ok(path) = locator.locate(None) {
        assert!(path.ends_with("hat-test/config.toml"));
    }
}

#[test]
#[serial]
fn test_resolve_path_priority() {
    env::set_var("HAT_TEST_ATLAS", "/data/env_atlas.sqlite");

    let from_cli = resolve_path(
        Some(Path::new("/data/cli_atlas.sqlite")),
        "HAT_TEST_ATLAS",
        Some(Path::new("/data/toml_atlas.sqlite")),
    );
    assert_eq!(from_cli, Some(PathBuf::from("/data/cli_atlas.sqlite")));

    let from_env = resolve_path(None, "HAT_TEST_ATLAS", Some(Path::new("/data/toml_atlas.sqlite")));
    assert_eq!(from_env, Some(PathBuf::from("/data/env_atlas.sqlite")));

    env::remove_var("HAT_TEST_ATLAS");

    let from_toml = resolve_path(None, "HAT_TEST_ATLAS", Some(Path::new("/data/toml_atlas.sqlite")));
    assert_eq!(from_toml, Some(PathBuf::from("/data/toml_atlas.sqlite")));

    assert_eq!(resolve_path(None, "HAT_TEST_ATLAS", None), None);
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config: SampleConfig = load_toml(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, SampleConfig::default());
}

#[test]
fn test_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");
    let config = SampleConfig {
        atlas_path: Some(PathBuf::from("/data/atlas.sqlite")),
        level: "debug".to_string(),
    };

    save_toml(&path, &config).unwrap();
    let loaded: SampleConfig = load_toml(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_malformed_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "atlas_path = [unclosed").unwrap();

    let result: hat_common::Result<SampleConfig> = load_toml(&path);
    assert!(matches!(result, Err(hat_common::Error::Config(_))));
}
