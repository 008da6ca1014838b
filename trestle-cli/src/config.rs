//! Configuration management for the trestle binary.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use trestle_chaos::ChaosConfig;
use trestle_testbed::ClusterConfig;

/// Default config file probed when `--config` is not given.
const DEFAULT_PATH: &str = "trestle.toml";

/// Full harness configuration, one TOML file with two sections.
///
/// ```toml
/// [cluster]
/// namespace = "chaos-testing"
///
/// [chaos]
/// trigger_rate = 0.8
/// polling_interval_ms = 5000
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrestleConfig {
    /// Cluster provisioning settings.
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Background fault scheduling settings.
    #[serde(default)]
    pub chaos: ChaosConfig,
}

impl TrestleConfig {
    /// Resolve configuration for a run.
    ///
    /// An explicit path must exist; without one, `trestle.toml` is used
    /// if present and the built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_PATH);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}
