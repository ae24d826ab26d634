//! Mount configuration.
//!
//! Durations are written in human form (`"1s"`, `"250ms"`) when the
//! configuration is loaded from JSON.

use nimbus_core::DEFAULT_UPLOAD_WORKERS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::MountResult;
use crate::logging::LogLevel;

/// Default TTL for attributes and lookup entries handed to the host.
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Configuration options for a mounted drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Diagnostic verbosity. Default: info.
    pub log_level: LogLevel,

    /// Number of upload lanes. Values below one are raised to one.
    pub upload_workers: usize,

    /// How long the host may cache attributes.
    #[serde(with = "humantime_serde")]
    pub attr_ttl: Duration,

    /// How long the host may cache lookup results.
    #[serde(with = "humantime_serde")]
    pub entry_ttl: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            upload_workers: DEFAULT_UPLOAD_WORKERS,
            attr_ttl: DEFAULT_TTL,
            entry_ttl: DEFAULT_TTL,
        }
    }
}

impl MountConfig {
    /// Parses a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> MountResult<Self> {
        let config: MountConfig = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        self.upload_workers = self.upload_workers.max(1);
        self
    }

    /// Sets the log level.
    #[must_use]
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets the number of upload lanes.
    #[must_use]
    pub fn upload_workers(mut self, workers: usize) -> Self {
        self.upload_workers = workers.max(1);
        self
    }

    /// Sets the attribute TTL.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// Sets the entry TTL.
    #[must_use]
    pub fn entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }
}
