//! Configuration for a single backup run.
//!
//! Loaded from a TOML file and then overridden field-by-field by CLI flags
//! (see `main.rs`). Shape mirrors [`crate::manifest::JobInfo`] directly,
//! since a run's configuration and its manifest are the same data.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::manifest::FULL_IF_OLDER_THAN_UNSET;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub job: JobConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Source snapshot dataset identifier (e.g. `tank/data`).
    pub volume_name: String,

    /// Ordered destination URIs; order defines the backend chain order.
    #[serde(default)]
    pub destinations: Vec<String>,

    /// Working directory for staging volumes and the manifest cache.
    pub working_dir: PathBuf,

    /// Target volume payload size in MiB.
    #[serde(default = "default_volume_size_mib")]
    pub volume_size_mib: u64,

    /// 0 selects pipe mode (no on-disk buffering, one volume in flight,
    /// a single destination).
    #[serde(default = "default_max_file_buffer")]
    pub max_file_buffer: usize,

    /// Bound on concurrent upload operations across the whole destination
    /// chain.
    #[serde(default = "default_max_parallel_uploads")]
    pub max_parallel_uploads: usize,

    /// Opaque option keys, compared byte-for-byte on resume.
    #[serde(default)]
    pub compressor: Option<String>,
    #[serde(default)]
    pub encrypt_to: Option<String>,
    #[serde(default)]
    pub sign_from: Option<String>,

    #[serde(default)]
    pub full: bool,
    #[serde(default)]
    pub incremental: bool,
    /// Force a full backup once the last comparable backup is this many
    /// hours old. Unset disables the age check.
    #[serde(default)]
    pub full_if_older_than_hours: Option<i64>,
    #[serde(default)]
    pub resume: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_volume_size_mib() -> u64 {
    64
}

fn default_max_file_buffer() -> usize {
    1
}

fn default_max_parallel_uploads() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

impl JobConfig {
    /// `full_if_older_than_hours` as the sentinel-encoded duration the
    /// planner and `JobInfo` expect.
    pub fn full_if_older_than(&self) -> chrono::Duration {
        match self.full_if_older_than_hours {
            Some(hours) => chrono::Duration::hours(hours),
            None => FULL_IF_OLDER_THAN_UNSET,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// A default configuration. Not runnable on its own (empty volume name
    /// and destination list); callers always override those via CLI or a
    /// config file before starting a run.
    pub fn default() -> Self {
        Config {
            job: JobConfig {
                volume_name: String::new(),
                destinations: Vec::new(),
                working_dir: PathBuf::from("/var/lib/snapvault"),
                volume_size_mib: default_volume_size_mib(),
                max_file_buffer: default_max_file_buffer(),
                max_parallel_uploads: default_max_parallel_uploads(),
                compressor: None,
                encrypt_to: None,
                sign_from: None,
                full: false,
                incremental: false,
                full_if_older_than_hours: None,
                resume: false,
            },
            log: LogConfig {
                level: default_log_level(),
            },
        }
    }
}
