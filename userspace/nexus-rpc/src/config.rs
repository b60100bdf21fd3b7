// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Runtime tunables loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::registry::RetryPolicy;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read rpc config {path}: {source}")]
    Read {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`RpcConfig`].
    #[error("failed to parse rpc config: {source}")]
    Parse {
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid rpc config: {0}")]
    Invalid(String),
}

/// Tunables for one process's RPC runtime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpcConfig {
    /// Hard cap on the number of bytes a single parcel may hold.
    pub max_parcel_capacity: usize,
    /// Default timeout for synchronous calls; zero waits forever.
    pub sync_timeout_ms: u64,
    /// Worker threads servicing inbound transactions.
    pub max_threads: usize,
    /// Registry lookups attempted before reporting `ServiceNotFound`.
    pub resolve_attempts: u32,
    /// Pause between registry lookups.
    pub resolve_backoff_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_parcel_capacity: 200 * 1024,
            sync_timeout_ms: 5_000,
            max_threads: 4,
            resolve_attempts: 5,
            resolve_backoff_ms: 50,
        }
    }
}

impl RpcConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(data).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&data)
    }

    /// Rejects values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::Invalid("max_threads must be at least 1".into()));
        }
        if self.max_parcel_capacity < 16 {
            return Err(ConfigError::Invalid("max_parcel_capacity must be at least 16".into()));
        }
        if self.resolve_attempts == 0 {
            return Err(ConfigError::Invalid("resolve_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Default synchronous timeout, `None` meaning unbounded.
    pub fn sync_timeout(&self) -> Option<Duration> {
        match self.sync_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Retry policy for registry resolution.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.resolve_attempts,
            backoff: Duration::from_millis(self.resolve_backoff_ms),
        }
    }
}
