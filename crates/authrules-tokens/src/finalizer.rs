//! Token Finalizer: turns a completed pipeline into signed tokens
use crate::config::TokenConfig;
use crate::namespace::ClaimNamespace;
use crate::signer::TokenSigner;
use crate::TokenError;
use authrules_core::{ClaimMap, Context, TransactionMetadata, User};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

/// Which claim map a stripped key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    #[serde(rename = "idToken")]
    IdToken,
    #[serde(rename = "accessToken")]
    AccessToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrippedClaim {
    pub token: TokenKind,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedTokens {
    pub id_token: String,
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub id_token_claims: ClaimMap,
    pub access_token_claims: ClaimMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stripped: Vec<StrippedClaim>,
}

#[derive(Debug)]
pub struct TokenFinalizer {
    config: TokenConfig,
    namespace: ClaimNamespace,
    signer: TokenSigner,
}

impl TokenFinalizer {
    pub fn new(config: TokenConfig) -> Self {
        let mut reserved = config.reserved_domains.clone();
        if let Some(host) = Url::parse(&config.issuer)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
        {
            reserved.push(host);
        }
        Self {
            namespace: ClaimNamespace::new(reserved),
            signer: TokenSigner::from_secret(&config.signing_secret, config.key_id.clone()),
            config,
        }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub fn namespace(&self) -> &ClaimNamespace {
        &self.namespace
    }

    /// Builds and signs both tokens. Standard claims always come from the
    /// finalizer; `context` only contributes namespaced custom claims.
    pub fn issue(
        &self,
        user: &User,
        context: &Context,
        transaction: &TransactionMetadata,
    ) -> Result<IssuedTokens, TokenError> {
        let now = Utc::now().timestamp();

        let (custom_id, stripped_id) = self.namespace.filter(&context.id_token);
        let (custom_access, stripped_access) = self.namespace.filter(&context.access_token);

        let mut id_claims = custom_id;
        id_claims.extend(self.id_token_claims(user, context, transaction, now));

        let mut access_claims = custom_access;
        access_claims.extend(self.access_token_claims(user, context, transaction, now));

        let stripped: Vec<StrippedClaim> = stripped_id
            .into_iter()
            .map(|key| StrippedClaim {
                token: TokenKind::IdToken,
                key,
            })
            .chain(stripped_access.into_iter().map(|key| StrippedClaim {
                token: TokenKind::AccessToken,
                key,
            }))
            .collect();
        if !stripped.is_empty() {
            let keys: Vec<&str> = stripped.iter().map(|s| s.key.as_str()).collect();
            tracing::debug!(client = %context.client_id, ?keys, "stripped non-namespaced claims");
        }

        Ok(IssuedTokens {
            id_token: self.signer.sign(&id_claims)?,
            access_token: self.signer.sign(&access_claims)?,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_token_ttl_secs,
            id_token_claims: id_claims,
            access_token_claims: access_claims,
            stripped,
        })
    }

    fn id_token_claims(
        &self,
        user: &User,
        context: &Context,
        transaction: &TransactionMetadata,
        now: i64,
    ) -> ClaimMap {
        let mut claims = ClaimMap::new();
        claims.insert("iss".into(), json!(self.config.issuer));
        claims.insert("sub".into(), json!(user.user_id));
        claims.insert("aud".into(), json!(context.client_id));
        claims.insert("iat".into(), json!(now));
        claims.insert("exp".into(), json!(expires_at(now, self.config.id_token_ttl_secs)));
        if let Some(nonce) = &transaction.nonce {
            claims.insert("nonce".into(), json!(nonce));
        }
        if let Some(email) = &user.email {
            claims.insert("email".into(), json!(email));
            claims.insert("email_verified".into(), json!(user.email_verified));
        }
        for (name, value) in [
            ("name", &user.name),
            ("nickname", &user.nickname),
            ("picture", &user.picture),
        ] {
            if let Some(value) = value {
                claims.insert(name.into(), Value::String(value.clone()));
            }
        }
        claims
    }

    fn access_token_claims(
        &self,
        user: &User,
        context: &Context,
        transaction: &TransactionMetadata,
        now: i64,
    ) -> ClaimMap {
        let audience = transaction
            .audience
            .clone()
            .or_else(|| self.config.default_audience.clone())
            .unwrap_or_else(|| context.client_id.clone());

        let mut claims = ClaimMap::new();
        claims.insert("iss".into(), json!(self.config.issuer));
        claims.insert("sub".into(), json!(user.user_id));
        claims.insert("aud".into(), json!(audience));
        claims.insert("azp".into(), json!(context.client_id));
        claims.insert("iat".into(), json!(now));
        claims.insert(
            "exp".into(),
            json!(expires_at(now, self.config.access_token_ttl_secs)),
        );
        if let Some(scope) = &transaction.scope {
            claims.insert("scope".into(), json!(scope));
        }
        claims
    }
}

/// `now + ttl`, pinned to `i64::MAX` for TTLs too large to represent.
fn expires_at(now: i64, ttl_secs: u64) -> i64 {
    i64::try_from(ttl_secs)
        .map(|ttl| now.saturating_add(ttl))
        .unwrap_or(i64::MAX)
}
