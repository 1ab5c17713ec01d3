// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Agent configuration.
//!
//! ```toml
//! endpoint = "unix:///run/remex/agent.sock"
//! cas-root = "/var/cache/remex/cas"
//! default-timeout-secs = 600
//! hash-type = "blake3"
//! ```
//!
//! Values come from the TOML file given with `--config`; command-line flags
//! override individual keys.

use std::path::{Path, PathBuf};
use std::time::Duration;

use remex_pips::HashType;
use remex_proto::{Endpoint, MAX_FRAME_LEN};
use remex_sandbox::DEFAULT_OUTPUT_CAPTURE_BYTES;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatcher::DispatcherSettings;

pub const DEFAULT_ENDPOINT: &str = "unix:///tmp/remex/agent.sock";
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct AgentConfig {
    pub endpoint: Endpoint,
    pub cas_root: PathBuf,
    /// Defaults to `<cas-root>/staging`
    pub staging_dir: Option<PathBuf>,
    pub default_timeout_secs: u64,
    pub hash_type: HashType,
    pub max_frame_bytes: usize,
    pub output_capture_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Unix(PathBuf::from("/tmp/remex/agent.sock")),
            cas_root: default_cas_root(),
            staging_dir: None,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            hash_type: HashType::default(),
            max_frame_bytes: MAX_FRAME_LEN,
            output_capture_bytes: DEFAULT_OUTPUT_CAPTURE_BYTES,
        }
    }
}

fn default_cas_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("remex")
        .join("cas")
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid("default-timeout-secs must be positive".into()));
        }
        if self.max_frame_bytes < 1024 {
            return Err(ConfigError::Invalid("max-frame-bytes must be at least 1024".into()));
        }
        Ok(())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.cas_root.join("staging"))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            default_timeout: self.default_timeout(),
            hash_type: self.hash_type,
            output_capture_bytes: self.output_capture_bytes,
        }
    }
}
