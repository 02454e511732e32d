//! Service configuration
//!
//! Loaded from the YAML file named by `AUTHRULES_CONFIG` (every field is
//! optional), then `AUTHRULES_ADDR` and `AUTHRULES_RULES_DIR` override the
//! listen address and rules directory.
use authrules_sandbox::{PoolConfig, SandboxConfig};
use authrules_tokens::TokenConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_ENV: &str = "AUTHRULES_CONFIG";
pub const ADDR_ENV: &str = "AUTHRULES_ADDR";
pub const RULES_DIR_ENV: &str = "AUTHRULES_RULES_DIR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("CONFIG/cannot read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("CONFIG/invalid YAML in {path}: {reason}")]
    Parse { path: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    #[serde(flatten)]
    pub limits: SandboxConfig,
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorsSection {
    /// Pass script error and timeout messages through to applications.
    pub expose_rule_errors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsSection {
    pub max_entries: usize,
}

impl Default for LogsSection {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen_addr: String,
    pub rules_dir: Option<PathBuf>,
    pub sandbox: SandboxSection,
    pub tokens: TokenConfig,
    pub errors: ErrorsSection,
    pub logs: LogsSection,
    /// Settings visible to every rule as `configuration`.
    pub configuration: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8787".to_string(),
            rules_dir: None,
            sandbox: SandboxSection::default(),
            tokens: TokenConfig::default(),
            errors: ErrorsSection::default(),
            logs: LogsSection::default(),
            configuration: BTreeMap::new(),
        }
    }
}

impl ServiceConfig {
    pub fn from_yaml(yaml: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: origin.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&yaml, path)
    }

    /// File (if `AUTHRULES_CONFIG` is set) plus environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        Ok(config.with_overrides(
            std::env::var(ADDR_ENV).ok(),
            std::env::var(RULES_DIR_ENV).ok(),
        ))
    }

    pub fn with_overrides(mut self, addr: Option<String>, rules_dir: Option<String>) -> Self {
        if let Some(addr) = addr.filter(|a| !a.trim().is_empty()) {
            self.listen_addr = addr;
        }
        if let Some(dir) = rules_dir.filter(|d| !d.trim().is_empty()) {
            self.rules_dir = Some(PathBuf::from(dir));
        }
        self
    }
}
