//! authrules registry: ordered rule storage, validation and manifests
pub mod loader;
pub mod registry;
pub mod validation;

pub use loader::{parse_manifests, RuleManifest};
pub use registry::{RuleRegistry, RuleSnapshot, RuleUpdate};
pub use validation::{validate_name, validate_script, MAX_NAME_LEN};

use authrules_core::RulesError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid rule: {0}")]
    Validation(String),

    #[error("a rule named '{0}' already exists")]
    DuplicateName(String),

    #[error("no rule named '{0}'")]
    NotFound(String),

    #[error("failed to load {path}: {reason}")]
    Load { path: String, reason: String },
}

impl From<RegistryError> for RulesError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Validation(msg) => RulesError::Validation(msg),
            RegistryError::DuplicateName(name) => RulesError::DuplicateName(name),
            RegistryError::NotFound(name) => RulesError::NotFound(name),
            load @ RegistryError::Load { .. } => RulesError::Validation(load.to_string()),
        }
    }
}
