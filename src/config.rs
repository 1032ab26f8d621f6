//! Server configuration.
//!
//! Loaded from a TOML file whose `[local_mirror]` table names the exported
//! directory and tunes caching and completion reaping. Missing required keys
//! fail the load with a pointed message rather than defaulting.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("cannot resolve export directory {path}: {source}")]
    BadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_nthreads() -> usize {
    1
}

fn default_queue_depth() -> u32 {
    64
}

fn default_socket() -> PathBuf {
    PathBuf::from("/tmp/mirrorfs.sock")
}

/// The `[local_mirror]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalMirror {
    /// Directory tree to export.
    pub dir: PathBuf,

    /// Entry/attribute cache TTL handed to the kernel, in seconds. Zero
    /// disables the writeback cache and turns on the unlink pre-invalidate
    /// path.
    pub metadata_timeout: f64,

    /// Busy-poll the ring completion queue instead of blocking.
    pub uring_cq_polling: bool,

    /// Completion reaper threads when polling is enabled.
    pub uring_cq_polling_nthreads: usize,

    /// Request poll threads.
    #[serde(default = "default_nthreads")]
    pub nthreads: usize,

    /// Ring submission queue depth; must be a power of two.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: u32,

    /// Unix socket the frame transport listens on.
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub local_mirror: LocalMirror,
}

impl Config {
    /// Load and validate a configuration file; the export directory is
    /// resolved to an absolute path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mirror = &mut config.local_mirror;
        mirror.dir = mirror
            .dir
            .canonicalize()
            .map_err(|source| ConfigError::BadDir {
                path: mirror.dir.clone(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mirror = &self.local_mirror;
        if mirror.metadata_timeout < 0.0 {
            return Err(ConfigError::Invalid(
                "metadata_timeout must be >= 0".into(),
            ));
        }
        if mirror.uring_cq_polling_nthreads < 1 {
            return Err(ConfigError::Invalid(
                "uring_cq_polling_nthreads must be >= 1".into(),
            ));
        }
        if mirror.nthreads < 1 {
            return Err(ConfigError::Invalid("nthreads must be >= 1".into()));
        }
        if mirror.queue_depth == 0 || !mirror.queue_depth.is_power_of_two() {
            return Err(ConfigError::Invalid(
                "queue_depth must be a power of two".into(),
            ));
        }
        Ok(())
    }
}
