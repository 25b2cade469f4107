//! TilePipe configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main TilePipe configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Catalog seed configuration
    pub catalog: CatalogConfig,

    /// Scheduling intervals and worker strategy
    pub scheduling: SchedulingConfig,

    /// Fleet worker RPC settings
    pub fleet: FleetConfig,

    /// Tile store settings
    pub storage: StorageConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.storage.batch_size == 0 {
            return Err(eyre::eyre!("storage.batch-size must be greater than zero"));
        }
        if self.scheduling.hub_interval_secs == 0 {
            return Err(eyre::eyre!("scheduling.hub-interval-secs must be greater than zero"));
        }
        if self.scheduling.stage_interval_secs == 0 {
            return Err(eyre::eyre!("scheduling.stage-interval-secs must be greater than zero"));
        }
        if self.scheduling.project_interval_secs == 0 {
            return Err(eyre::eyre!("scheduling.project-interval-secs must be greater than zero"));
        }
        if self.fleet.request_timeout_ms == 0 {
            return Err(eyre::eyre!("fleet.request-timeout-ms must be greater than zero"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .tilepipe.yml
        let local_config = PathBuf::from(".tilepipe.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/tilepipe/tilepipe.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("tilepipe").join("tilepipe.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Catalog seed configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// YAML file describing projects, stages, tasks, and workers
    #[serde(rename = "seed-path")]
    pub seed_path: Option<PathBuf>,
}

/// Scheduling intervals and worker strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Seconds between hub reconciliation passes
    #[serde(rename = "hub-interval-secs")]
    pub hub_interval_secs: u64,

    /// Seconds between stage scheduling cycles
    #[serde(rename = "stage-interval-secs")]
    pub stage_interval_secs: u64,

    /// Seconds between acquisition manifest ingests
    #[serde(rename = "project-interval-secs")]
    pub project_interval_secs: u64,

    /// Run stage workers as child processes instead of in-process tasks
    #[serde(rename = "child-process-workers")]
    pub child_process_workers: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            hub_interval_secs: 10,
            stage_interval_secs: 30,
            project_interval_secs: 30,
            child_process_workers: false,
        }
    }
}

impl SchedulingConfig {
    pub fn hub_interval(&self) -> Duration {
        Duration::from_secs(self.hub_interval_secs)
    }

    pub fn stage_interval(&self) -> Duration {
        Duration::from_secs(self.stage_interval_secs)
    }

    pub fn project_interval(&self) -> Duration {
        Duration::from_secs(self.project_interval_secs)
    }
}

/// Fleet worker RPC settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Request timeout in milliseconds
    #[serde(rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
        }
    }
}

impl FleetConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Tile store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Rows per write transaction in the tile stores
    #[serde(rename = "batch-size")]
    pub batch_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_size: tilestore::DEFAULT_BATCH_SIZE,
        }
    }
}
