//! hat-match configuration file
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [atlas]
//! atlas_path = "/data/hemilineage_atlas.db"
//! expected_hemilineages = 142
//!
//! [search]
//! radius_scale = 3.0
//! mirror_width_um = 627.0
//! mirror_query = false
//!
//! [scoring]
//! workers = 0
//! rescore = true
//!
//! [nblast]
//! sigma_um = 3.0
//! k = 100
//! resample_um = 1.0
//! direction = "atlas_to_image"
//! symmetric = true
//! use_alpha = false
//! drop_fluff = true
//! ```

use crate::error::Result;
use crate::scoring::NblastParams;
use crate::search::SearchParams;
use crate::session::SessionConfig;
use hat_common::config::{load_toml, resolve_path, save_toml, ConfigLocator};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const APP_NAME: &str = "hat-match";
pub const CONFIG_ENV_VAR: &str = "HAT_MATCH_CONFIG";
pub const ATLAS_ENV_VAR: &str = "HAT_ATLAS_PATH";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub logging: LoggingConfig,
    pub atlas: AtlasConfig,
    pub search: SearchParams,
    pub scoring: ScoringConfig,
    pub nblast: NblastParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atlas_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_hemilineages: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Concurrent candidates, 0 = number of CPUs
    pub workers: usize,
    pub rescore: bool,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            rescore: true,
        }
    }
}

impl MatchConfig {
    pub fn locator() -> ConfigLocator {
        ConfigLocator::new(APP_NAME, CONFIG_ENV_VAR)
    }

    /// Load from an explicit file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        Ok(load_toml(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_toml(path, self)?;
        Ok(())
    }

    /// Atlas location from the command line, `HAT_ATLAS_PATH`, then this file
    pub fn resolve_atlas_path(&self, cli_arg: Option<&Path>) -> Option<PathBuf> {
        resolve_path(cli_arg, ATLAS_ENV_VAR, self.atlas.atlas_path.as_deref())
    }

    /// Record a working atlas path so later runs find it
    pub fn remember_atlas_path(&mut self, path: &Path, config_path: &Path) -> Result<()> {
        if self.atlas.atlas_path.as_deref() == Some(path) {
            return Ok(());
        }
        self.atlas.atlas_path = Some(path.to_path_buf());
        self.save(config_path)?;
        info!(
            atlas = %path.display(),
            config = %config_path.display(),
            "Atlas path saved to config"
        );
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            search: self.search,
            nblast: self.nblast,
            workers: self.scoring.workers,
            rescore: self.scoring.rescore,
            expected_hemilineages: self.atlas.expected_hemilineages,
        }
    }
}
