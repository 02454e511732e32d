//! Token Finalizer: the last step of a transaction.
//!
//! A completed pipeline becomes a signed ID token and access token (custom
//! claims filtered by [`ClaimNamespace`]); a halted one becomes exactly one
//! protocol-appropriate [`ErrorPayload`].
pub mod config;
pub mod finalizer;
pub mod namespace;
pub mod payload;
pub mod signer;

pub use config::TokenConfig;
pub use finalizer::{IssuedTokens, StrippedClaim, TokenFinalizer, TokenKind};
pub use namespace::ClaimNamespace;
pub use payload::{ErrorCode, ErrorPayload, ProtocolError};
pub use signer::{JwsHeader, TokenSigner};

use authrules_core::Protocol;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("TOKEN/malformed token: {0}")]
    Malformed(String),

    #[error("TOKEN/signature does not verify")]
    BadSignature,

    #[error("TOKEN/{0} requires a callback_url")]
    MissingCallback(Protocol),

    #[error("TOKEN/invalid callback_url {0}")]
    InvalidCallback(String),

    #[error("TOKEN/serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}
