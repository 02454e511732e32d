//! Compact JWS (EdDSA) signing and verification
use crate::TokenError;
use authrules_core::ClaimMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

const KEY_CONTEXT: &str = "authrules 2026 token signing key v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

pub struct TokenSigner {
    key: SigningKey,
    key_id: String,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Derives the ed25519 key from `secret` with blake3's KDF mode.
    pub fn from_secret(secret: &str, key_id: impl Into<String>) -> Self {
        let seed = blake3::derive_key(KEY_CONTEXT, secret.as_bytes());
        Self {
            key: SigningKey::from_bytes(&seed),
            key_id: key_id.into(),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Public key, base64url, for publishing alongside `kid`.
    pub fn public_key(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.key.verifying_key().as_bytes())
    }

    pub fn sign(&self, claims: &ClaimMap) -> Result<String, TokenError> {
        let header = JwsHeader {
            alg: "EdDSA".to_string(),
            typ: "JWT".to_string(),
            kid: self.key_id.clone(),
        };
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signing_input = format!("{header}.{payload}");
        let signature = self.key.sign(signing_input.as_bytes());
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    /// Checks the signature and returns the claims. Expiry is the caller's
    /// concern.
    pub fn verify(&self, token: &str) -> Result<ClaimMap, TokenError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed("expected three segments".to_string()));
        };

        let decode = |segment: &str| {
            URL_SAFE_NO_PAD
                .decode(segment)
                .map_err(|e| TokenError::Malformed(e.to_string()))
        };

        let parsed: JwsHeader = serde_json::from_slice(&decode(header)?)?;
        if parsed.alg != "EdDSA" {
            return Err(TokenError::Malformed(format!("unsupported alg {}", parsed.alg)));
        }
        let signature = Signature::from_slice(&decode(signature)?)
            .map_err(|e| TokenError::Malformed(e.to_string()))?;
        self.key
            .verifying_key()
            .verify(format!("{header}.{payload}").as_bytes(), &signature)
            .map_err(|_| TokenError::BadSignature)?;

        Ok(serde_json::from_slice(&decode(payload)?)?)
    }
}
