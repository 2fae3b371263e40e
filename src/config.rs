// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Configuration persistence for cleany
//!
//! All cleany data is stored under ~/.cleany/:
//! - ~/.cleany/config.json - scheduler and evaluator settings
//! - ~/.cleany/logs/ - default location of the optional log file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::evaluator::{DEFAULT_MEMORY_LIMIT, Evaluator};
use crate::pipeline::DEFAULT_EVALUATION_CONCURRENCY;
use crate::scheduler::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_TASK_TIMEOUT, DEFAULT_WORKERS, SchedulerConfig,
};

/// Default interval between two reconciliations of Cleaner objects
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;

/// Get the base cleany directory (~/.cleany/)
pub fn base_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|p| p.join(".cleany"))
        .context("Could not determine home directory")
}

/// cleany configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool size
    pub workers: usize,
    /// Wall time of one job in seconds
    pub task_timeout_secs: u64,
    /// Capacity of the job queue
    pub queue_capacity: usize,
    /// Candidates evaluated in parallel per selector
    pub evaluation_concurrency: usize,
    /// Memory cap of one script interpreter in bytes
    pub script_memory_limit: usize,
    /// Seconds between two Cleaner reconciliations in `run` mode
    pub resync_interval_secs: u64,
    /// Directory for the rolling log file, no file logging when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT.as_secs(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            evaluation_concurrency: DEFAULT_EVALUATION_CONCURRENCY,
            script_memory_limit: DEFAULT_MEMORY_LIMIT,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            log_dir: None,
        }
    }
}

impl Config {
    /// Load config from the default location, or return defaults if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from `path`, or return defaults if the file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Get the config file path (~/.cleany/config.json)
    pub fn config_path() -> Result<PathBuf> {
        Ok(base_dir()?.join("config.json"))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs.max(1))
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers.max(1),
            task_timeout: self.task_timeout(),
            queue_capacity: self.queue_capacity.max(1),
        }
    }

    pub fn evaluator(&self) -> Evaluator {
        Evaluator::new(self.script_memory_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.task_timeout_secs, 60);
        assert_eq!(config.queue_capacity, 2000);
        assert_eq!(config.evaluation_concurrency, 8);
        assert_eq!(config.script_memory_limit, 16 * 1024 * 1024);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_config_deserialize_partial() {
        let json = r#"{"workers": 2, "task_timeout_secs": 10}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.task_timeout_secs, 10);
        assert_eq!(config.queue_capacity, 2000);
        assert_eq!(config.resync_interval_secs, 300);
    }

    #[test]
    fn test_config_deserialize_empty() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_scheduler_config_clamps_zero_values() {
        let config = Config {
            workers: 0,
            task_timeout_secs: 0,
            queue_capacity: 0,
            ..Default::default()
        };
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.workers, 1);
        assert_eq!(scheduler.task_timeout, Duration::from_secs(1));
        assert_eq!(scheduler.queue_capacity, 1);
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.json");

        let config = Config {
            workers: 8,
            log_dir: Some(PathBuf::from("/var/log/cleany")),
            ..Default::default()
        };
        config.save_to(&config_path).unwrap();

        let loaded = Config::load_from(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = Config::load_from(&temp_dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
