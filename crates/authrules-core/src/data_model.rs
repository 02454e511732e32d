//! Data Model: User, Context, RuleDefinition and the raw transaction inputs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Open extension mapping used for metadata and anything a rule adds.
pub type JsonMap = BTreeMap<String, Value>;

/// Claim name → claim value, as set by rules on `context.idToken` /
/// `context.accessToken`.
pub type ClaimMap = BTreeMap<String, Value>;

/// Read-mostly user record handed to every rule.
///
/// Rules may add properties (they land in `extra`), but nothing here is
/// persisted beyond the transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default)]
    pub identities: Vec<Identity>,
    #[serde(default)]
    pub app_metadata: JsonMap,
    #[serde(default)]
    pub user_metadata: JsonMap,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl User {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            email_verified: false,
            name: None,
            nickname: None,
            picture: None,
            identities: Vec::new(),
            app_metadata: JsonMap::new(),
            user_metadata: JsonMap::new(),
            extra: JsonMap::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// A linked account at an upstream provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub provider: String,
    pub user_id: String,
    pub connection: String,
    #[serde(rename = "isSocial", default)]
    pub is_social: bool,
}

/// Mutable per-transaction record threaded through the pipeline.
///
/// Field names on the wire follow what rule scripts see (`clientID`,
/// `idToken`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub tenant: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(default)]
    pub client_name: String,
    pub connection: String,
    #[serde(default)]
    pub connection_strategy: String,
    pub protocol: Protocol,
    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub request: RequestInfo,
    #[serde(default)]
    pub stats: LoginStats,
    #[serde(default)]
    pub authentication: AuthenticationInfo,
    #[serde(default)]
    pub id_token: ClaimMap,
    #[serde(default)]
    pub access_token: ClaimMap,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl Context {
    pub fn new(
        client_id: impl Into<String>,
        connection: impl Into<String>,
        protocol: Protocol,
    ) -> Self {
        Self {
            tenant: "default".to_string(),
            client_id: client_id.into(),
            client_name: String::new(),
            connection: connection.into(),
            connection_strategy: String::new(),
            protocol,
            session_id: None,
            request: RequestInfo::default(),
            stats: LoginStats::default(),
            authentication: AuthenticationInfo::default(),
            id_token: ClaimMap::new(),
            access_token: ClaimMap::new(),
            extra: JsonMap::new(),
        }
    }
}

/// Network origin of the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geoip: Option<GeoIp>,
    #[serde(default)]
    pub query: JsonMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoIp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStats {
    #[serde(default)]
    pub logins_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationInfo {
    #[serde(default)]
    pub methods: Vec<AuthenticationMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationMethod {
    pub name: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Protocol the application used to start the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "oidc-basic-profile")]
    OidcBasicProfile,
    #[serde(rename = "oidc-implicit-profile")]
    OidcImplicitProfile,
    #[serde(rename = "oauth2")]
    OAuth2,
    #[serde(rename = "oauth2-resource-owner")]
    OAuth2ResourceOwner,
    #[serde(rename = "oauth2-refresh-token")]
    OAuth2RefreshToken,
    #[serde(rename = "oauth2-device-code")]
    OAuth2DeviceCode,
    #[serde(rename = "samlp")]
    Samlp,
    #[serde(rename = "wsfed")]
    WsFed,
}

/// How results (tokens or errors) travel back to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Browser redirect to the registered callback URL.
    Redirect,
    /// A signed assertion posted to the callback URL.
    SignedAssertion,
    /// Direct back-channel response.
    Direct,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OidcBasicProfile => "oidc-basic-profile",
            Protocol::OidcImplicitProfile => "oidc-implicit-profile",
            Protocol::OAuth2 => "oauth2",
            Protocol::OAuth2ResourceOwner => "oauth2-resource-owner",
            Protocol::OAuth2RefreshToken => "oauth2-refresh-token",
            Protocol::OAuth2DeviceCode => "oauth2-device-code",
            Protocol::Samlp => "samlp",
            Protocol::WsFed => "wsfed",
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            Protocol::OidcBasicProfile | Protocol::OidcImplicitProfile | Protocol::OAuth2 => {
                Transport::Redirect
            }
            Protocol::Samlp | Protocol::WsFed => Transport::SignedAssertion,
            Protocol::OAuth2ResourceOwner
            | Protocol::OAuth2RefreshToken
            | Protocol::OAuth2DeviceCode => Transport::Direct,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    #[default]
    Query,
    Fragment,
}

/// Raw identity-provider assertion, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityAssertion {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub identities: Vec<Identity>,
    #[serde(default)]
    pub app_metadata: JsonMap,
    #[serde(default)]
    pub user_metadata: JsonMap,
    #[serde(default)]
    pub logins_count: u64,
    #[serde(default)]
    pub authentication_methods: Vec<AuthenticationMethod>,
    /// Provider-specific attributes, copied onto the user as-is.
    #[serde(flatten)]
    pub attributes: JsonMap,
}

/// Everything about the transaction that is not the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMetadata {
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default)]
    pub connection_strategy: Option<String>,
    pub protocol: Protocol,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub geoip: Option<GeoIp>,
    #[serde(default)]
    pub query: JsonMap,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub response_mode: ResponseMode,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_tenant() -> String {
    "default".to_string()
}

impl TransactionMetadata {
    pub fn new(
        client_id: impl Into<String>,
        connection: impl Into<String>,
        protocol: Protocol,
    ) -> Self {
        Self {
            tenant: default_tenant(),
            client_id: Some(client_id.into()),
            client_name: None,
            connection: Some(connection.into()),
            connection_strategy: None,
            protocol,
            session_id: None,
            ip: None,
            user_agent: None,
            hostname: None,
            geoip: None,
            query: JsonMap::new(),
            callback_url: None,
            response_mode: ResponseMode::Query,
            state: None,
            nonce: None,
            audience: None,
            scope: None,
        }
    }

    pub fn with_callback(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }
}

/// A rule as stored in the registry and read by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: Uuid,
    pub name: String,
    pub script: String,
    pub order: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Creation sequence; breaks ties between equal `order` values.
    pub sequence: u64,
}

impl RuleDefinition {
    pub fn new(name: impl Into<String>, script: impl Into<String>, order: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            script: script.into(),
            order,
            enabled: true,
            created_at: now,
            updated_at: now,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Sort key used everywhere rules are ranked.
    pub fn rank(&self) -> (i64, u64) {
        (self.order, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_uses_script_facing_names() {
        let mut ctx = Context::new("app-1", "Username-Password", Protocol::OidcBasicProfile);
        ctx.id_token.insert("https://ns/a".to_string(), json!(1));

        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["clientID"], "app-1");
        assert_eq!(value["protocol"], "oidc-basic-profile");
        assert_eq!(value["idToken"]["https://ns/a"], 1);
        assert!(value.get("sessionID").is_none());
    }

    #[test]
    fn test_unknown_context_properties_land_in_extra() {
        let mut value = serde_json::to_value(Context::new("c", "conn", Protocol::Samlp)).unwrap();
        value["riskScore"] = json!(7);

        let ctx: Context = serde_json::from_value(value).unwrap();
        assert_eq!(ctx.extra.get("riskScore"), Some(&json!(7)));
    }

    #[test]
    fn test_user_extra_roundtrips() {
        let mut user = User::new("auth0|1").with_email("a@example.com");
        user.extra.insert("plan".to_string(), json!("pro"));

        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["plan"], "pro");
        let back: User = serde_json::from_value(value).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn test_protocol_transport() {
        assert_eq!(Protocol::OidcBasicProfile.transport(), Transport::Redirect);
        assert_eq!(Protocol::WsFed.transport(), Transport::SignedAssertion);
        assert_eq!(Protocol::OAuth2ResourceOwner.transport(), Transport::Direct);
        assert_eq!(Protocol::Samlp.to_string(), "samlp");
    }

    #[test]
    fn test_rule_rank_orders_by_order_then_sequence() {
        let a = RuleDefinition::new("a", "", 2).with_sequence(5);
        let b = RuleDefinition::new("b", "", 2).with_sequence(1);
        let c = RuleDefinition::new("c", "", 1).with_sequence(9);
        let mut rules = vec![a, b, c];
        rules.sort_by_key(|r| r.rank());
        let names: Vec<_> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }
}
