use serde::{Deserialize, Serialize};
use std::path::Path;
use std::thread;

use crate::errors::SystemError;

/// Settings for [`Runtime::start`](crate::system::Runtime::start).
///
/// Every field has a default, so an empty TOML document is a valid config:
///
/// ```toml
/// workers = 4
/// thread_name = "troupe"
/// log_level = "info"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Size of the worker pool. At most this many `handle` calls run at once.
    pub workers: usize,
    /// Prefix for the names of every thread the runtime starts
    pub thread_name: String,
    /// Level passed to [`setup_global_logging`](crate::logging::setup_global_logging)
    /// by binaries that load their logging setup from this config
    pub log_level: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            thread_name: "troupe".to_string(),
            log_level: "info".to_string(),
        }
    }
}

fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

impl SystemConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: SystemConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), SystemError> {
        if self.workers == 0 {
            return Err(SystemError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.thread_name.is_empty() {
            return Err(SystemError::InvalidConfig(
                "thread_name must not be empty".to_string(),
            ));
        }
        self.level()?;
        Ok(())
    }

    /// The configured log level, parsed.
    pub fn level(&self) -> Result<tracing::Level, SystemError> {
        self.log_level.parse().map_err(|_| {
            SystemError::InvalidConfig(format!("unknown log level {:?}", self.log_level))
        })
    }
}
