//! Configuration loading for the testbed.
//!
//! Configuration is loaded from a TOML file (default: `trestle.toml`).

use serde::Deserialize;
use std::path::PathBuf;

/// Cluster provisioning configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Kubernetes namespace the testbed provisions into (default: default).
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Container image for cluster pods; must ship the database server
    /// binaries, a mysql client and tmux (default: trestle/cluster-base:latest).
    #[serde(default = "default_image")]
    pub image: String,
    /// Seconds to wait for all pods to reach Running, polling once per
    /// second (default: 30).
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    /// Seconds to sleep between node process launches; 0 launches
    /// back-to-back (default: 1).
    #[serde(default = "default_launch_stagger")]
    pub launch_stagger_secs: u64,
}

// Default value functions
fn default_namespace() -> String {
    "default".to_string()
}

fn default_image() -> String {
    "trestle/cluster-base:latest".to_string()
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_launch_stagger() -> u64 {
    1
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            image: default_image(),
            startup_timeout_secs: default_startup_timeout(),
            launch_stagger_secs: default_launch_stagger(),
        }
    }
}

impl ClusterConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Errors from loading a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// File that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`ClusterConfig`].
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// File that was attempted.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
