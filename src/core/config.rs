//! Runtime configuration loaded from `stormledger.toml`.
//!
//! A missing file is not an error: every field has a default, and
//! `STORMLEDGER_ROOT` overrides the store location either way.

use crate::core::error::StormError;
use crate::core::store::Store;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "stormledger.toml";
pub const ROOT_ENV_VAR: &str = "STORMLEDGER_ROOT";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct StormConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PipelineConfig {
    /// Worker threads for scope computation; 0 keeps rayon's default.
    #[serde(default)]
    pub threads: usize,
    /// Actor recorded in the broker audit log.
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_root() -> PathBuf {
    PathBuf::from(".stormledger")
}

fn default_actor() -> String {
    "stormledger".to_string()
}

fn default_filter() -> String {
    "stormledger=info".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { root: default_root() }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            actor: default_actor(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

impl StormConfig {
    /// Store handle after applying the environment override.
    pub fn store(&self) -> Store {
        match env::var(ROOT_ENV_VAR) {
            Ok(root) if !root.trim().is_empty() => Store::new(root),
            _ => Store::new(self.store.root.clone()),
        }
    }
}

/// Load config from an explicit path, or `stormledger.toml` in `dir`.
/// An explicit path that does not exist is an error; the implicit one is not.
pub fn load_config(explicit: Option<&Path>, dir: &Path) -> Result<StormConfig, StormError> {
    let (path, required) = match explicit {
        Some(p) => (p.to_path_buf(), true),
        None => (dir.join(CONFIG_FILE_NAME), false),
    };

    if !path.exists() {
        if required {
            return Err(StormError::ConfigError(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        return Ok(StormConfig::default());
    }

    let content = fs::read_to_string(&path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<StormConfig, StormError> {
    toml::from_str(content).map_err(|e| StormError::ConfigError(e.to_string()))
}
