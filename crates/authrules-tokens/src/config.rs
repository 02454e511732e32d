//! Token issuance settings
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// `iss` of every issued token; its host is always a reserved namespace.
    pub issuer: String,
    /// Access-token audience when the transaction names none.
    pub default_audience: Option<String>,
    pub id_token_ttl_secs: u64,
    pub access_token_ttl_secs: u64,
    /// Secret the ed25519 signing key is derived from.
    pub signing_secret: String,
    pub key_id: String,
    /// Domains custom claims may not be namespaced under (subdomains
    /// included).
    pub reserved_domains: Vec<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "https://authrules.local/".to_string(),
            default_audience: None,
            id_token_ttl_secs: 36_000,
            access_token_ttl_secs: 86_400,
            signing_secret: "change-me".to_string(),
            key_id: "authrules-1".to_string(),
            reserved_domains: vec![
                "auth0.com".to_string(),
                "webtask.io".to_string(),
                "webtask.run".to_string(),
            ],
        }
    }
}
