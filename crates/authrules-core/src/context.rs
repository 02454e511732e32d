//! Context Builder: turns an upstream assertion plus transaction metadata
//! into the `User`/`Context` pair fed to the first rule.
use crate::data_model::{
    AuthenticationInfo, ClaimMap, Context, Identity, IdentityAssertion, LoginStats, RequestInfo,
    TransactionMetadata, User,
};
use crate::error::ContextBuildError;

/// Providers whose identities are not social logins.
const NON_SOCIAL_PROVIDERS: &[&str] = &[
    "auth0", "email", "sms", "samlp", "waad", "adfs", "ad", "oidc", "okta", "ping",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextBuilder;

impl ContextBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Builds the initial pair. Pure: reads its inputs and allocates.
    pub fn build(
        &self,
        assertion: &IdentityAssertion,
        meta: &TransactionMetadata,
    ) -> Result<(User, Context), ContextBuildError> {
        let user_id = required("user_id", assertion.user_id.as_deref())?;
        let client_id = required("client_id", meta.client_id.as_deref())?;
        let connection = required("connection", meta.connection.as_deref())?;

        if meta.tenant.trim().is_empty() {
            return Err(ContextBuildError::InvalidField {
                field: "tenant",
                reason: "must not be blank".to_string(),
            });
        }

        let provider = non_blank(assertion.provider.as_deref());
        let strategy = non_blank(meta.connection_strategy.as_deref())
            .or(provider)
            .unwrap_or(connection)
            .to_string();

        let identities = if !assertion.identities.is_empty() {
            assertion.identities.clone()
        } else if let Some(provider) = provider {
            vec![Identity {
                provider: provider.to_string(),
                user_id: provider_local_id(user_id).to_string(),
                connection: connection.to_string(),
                is_social: !NON_SOCIAL_PROVIDERS.contains(&provider),
            }]
        } else {
            Vec::new()
        };

        let user = User {
            user_id: user_id.to_string(),
            email: assertion.email.clone(),
            email_verified: assertion.email_verified.unwrap_or(false),
            name: assertion.name.clone(),
            nickname: assertion.nickname.clone(),
            picture: assertion.picture.clone(),
            identities,
            app_metadata: assertion.app_metadata.clone(),
            user_metadata: assertion.user_metadata.clone(),
            extra: assertion.attributes.clone(),
        };

        let context = Context {
            tenant: meta.tenant.clone(),
            client_id: client_id.to_string(),
            client_name: meta.client_name.clone().unwrap_or_default(),
            connection: connection.to_string(),
            connection_strategy: strategy,
            protocol: meta.protocol,
            session_id: meta.session_id.clone(),
            request: RequestInfo {
                ip: meta.ip.clone(),
                user_agent: meta.user_agent.clone(),
                hostname: meta.hostname.clone(),
                geoip: meta.geoip.clone(),
                query: meta.query.clone(),
            },
            stats: LoginStats {
                logins_count: assertion.logins_count,
            },
            authentication: AuthenticationInfo {
                methods: assertion.authentication_methods.clone(),
            },
            id_token: ClaimMap::new(),
            access_token: ClaimMap::new(),
            extra: Default::default(),
        };

        Ok((user, context))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn required<'a>(
    field: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, ContextBuildError> {
    non_blank(value).ok_or(ContextBuildError::MissingField(field))
}

/// `google-oauth2|1234` → `1234`.
fn provider_local_id(user_id: &str) -> &str {
    user_id.split_once('|').map(|(_, id)| id).unwrap_or(user_id)
}
