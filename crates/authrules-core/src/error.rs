//! Unified Error Model
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RulesError {
    #[error("VALIDATION/{0}")]
    Validation(String),

    #[error("DUPLICATE/{0}")]
    DuplicateName(String),

    #[error("NOT_FOUND/{0}")]
    NotFound(String),

    #[error("CONTEXT/{0}")]
    ContextBuild(#[from] ContextBuildError),

    #[error("UNAUTHORIZED/{0}")]
    Unauthorized(String),

    #[error("RULE/{0}")]
    Generic(String),

    #[error("TIMEOUT/{0}")]
    Timeout(String),

    #[error("SERIALIZE/{0}")]
    Serialize(String),
}

/// Raised when the upstream identity assertion cannot be turned into a
/// `User`/`Context` pair.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextBuildError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}
