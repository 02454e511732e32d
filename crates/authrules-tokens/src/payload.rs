//! Protocol-appropriate error payloads for halted transactions
//!
//! | transport        | payload                                            |
//! |------------------|----------------------------------------------------|
//! | redirect         | `302` to the callback, error in query or fragment  |
//! | signed assertion | SAML-style Response, base64, auto-POST form        |
//! | direct           | JSON `{error, error_description}`, 401 / 403       |
use crate::TokenError;
use authrules_core::{ErrorCause, ResponseMode, Terminal, TransactionMetadata, Transport};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::form_urlencoded;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    AccessDenied,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::AccessDenied => "access_denied",
        }
    }
}

/// What the application is told about a halted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub error: ErrorCode,
    pub error_description: String,
}

impl ProtocolError {
    pub fn denied(message: &str) -> Self {
        Self {
            error: ErrorCode::Unauthorized,
            error_description: message.to_string(),
        }
    }

    /// Script and timeout messages are only passed through when
    /// `expose_rule_errors` is set.
    pub fn errored(message: &str, cause: ErrorCause, expose_rule_errors: bool) -> Self {
        let description = if expose_rule_errors {
            message.to_string()
        } else {
            match cause {
                ErrorCause::Script => "rule execution failed".to_string(),
                ErrorCause::Timeout => "rule execution timed out".to_string(),
            }
        };
        Self {
            error: ErrorCode::AccessDenied,
            error_description: description,
        }
    }

    /// `None` for a completed pipeline.
    pub fn from_terminal(terminal: &Terminal, expose_rule_errors: bool) -> Option<Self> {
        match terminal {
            Terminal::Completed { .. } => None,
            Terminal::Denied { message, .. } => Some(Self::denied(message)),
            Terminal::Errored { message, cause, .. } => {
                Some(Self::errored(message, *cause, expose_rule_errors))
            }
        }
    }

    fn pairs<'a>(&'a self, state: Option<&'a str>) -> Vec<(&'static str, &'a str)> {
        let mut pairs = vec![
            ("error", self.error.as_str()),
            ("error_description", self.error_description.as_str()),
        ];
        if let Some(state) = state {
            pairs.push(("state", state));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorPayload {
    Redirect {
        location: String,
    },
    Assertion {
        destination: String,
        saml_response: String,
        relay_state: Option<String>,
        form: String,
    },
    Json {
        status: u16,
        body: Value,
    },
}

impl ErrorPayload {
    /// Fails when a halted `transaction` would have nowhere to deliver its
    /// error: redirect and signed-assertion protocols need a parseable
    /// callback URL.
    pub fn check_delivery(transaction: &TransactionMetadata) -> Result<(), TokenError> {
        match transaction.protocol.transport() {
            Transport::Redirect | Transport::SignedAssertion => callback(transaction).map(|_| ()),
            Transport::Direct => Ok(()),
        }
    }

    pub fn build(
        error: &ProtocolError,
        transaction: &TransactionMetadata,
    ) -> Result<Self, TokenError> {
        match transaction.protocol.transport() {
            Transport::Redirect => redirect(error, transaction),
            Transport::SignedAssertion => assertion(error, transaction),
            Transport::Direct => Ok(ErrorPayload::Json {
                status: match error.error {
                    ErrorCode::Unauthorized => 401,
                    ErrorCode::AccessDenied => 403,
                },
                body: json!({
                    "error": error.error.as_str(),
                    "error_description": error.error_description,
                }),
            }),
        }
    }
}

fn callback(transaction: &TransactionMetadata) -> Result<Url, TokenError> {
    let raw = transaction
        .callback_url
        .as_deref()
        .ok_or(TokenError::MissingCallback(transaction.protocol))?;
    Url::parse(raw).map_err(|e| TokenError::InvalidCallback(format!("{raw}: {e}")))
}

fn redirect(
    error: &ProtocolError,
    transaction: &TransactionMetadata,
) -> Result<ErrorPayload, TokenError> {
    let mut url = callback(transaction)?;
    let pairs = error.pairs(transaction.state.as_deref());
    match transaction.response_mode {
        ResponseMode::Query => {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        ResponseMode::Fragment => {
            let fragment = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            url.set_fragment(Some(&fragment));
        }
    }
    Ok(ErrorPayload::Redirect {
        location: url.to_string(),
    })
}

fn assertion(
    error: &ProtocolError,
    transaction: &TransactionMetadata,
) -> Result<ErrorPayload, TokenError> {
    let destination = callback(transaction)?.to_string();
    let issued_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let response_id = format!("_{}", blake3::hash(format!("{destination}{issued_at}").as_bytes()));

    let xml = format!(
        concat!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" "#,
            r#"ID="{id}" Version="2.0" IssueInstant="{at}" Destination="{dest}">"#,
            r#"<samlp:Status>"#,
            r#"<samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Responder"/>"#,
            r#"<samlp:StatusMessage>{message}</samlp:StatusMessage>"#,
            r#"</samlp:Status>"#,
            r#"</samlp:Response>"#
        ),
        id = response_id,
        at = issued_at,
        dest = xml_escape(&destination),
        message = xml_escape(&format!("{}: {}", error.error.as_str(), error.error_description)),
    );
    let saml_response = STANDARD.encode(xml.as_bytes());

    let relay = transaction
        .state
        .as_deref()
        .map(|s| format!(r#"<input type="hidden" name="RelayState" value="{}"/>"#, xml_escape(s)))
        .unwrap_or_default();
    let form = format!(
        concat!(
            r#"<html><body onload="document.forms[0].submit()">"#,
            r#"<form method="post" action="{action}">"#,
            r#"<input type="hidden" name="SAMLResponse" value="{response}"/>{relay}"#,
            r#"<noscript><input type="submit" value="Continue"/></noscript>"#,
            r#"</form></body></html>"#
        ),
        action = xml_escape(&destination),
        response = saml_response,
        relay = relay,
    );

    Ok(ErrorPayload::Assertion {
        destination,
        saml_response,
        relay_state: transaction.state.clone(),
        form,
    })
}

fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrules_core::{Context, Protocol, User};

    #[test]
    fn test_from_terminal_hides_script_errors_by_default() {
        let errored = Terminal::Errored {
            rule: "r".into(),
            message: "db password wrong".into(),
            cause: ErrorCause::Script,
        };
        let hidden = ProtocolError::from_terminal(&errored, false).unwrap();
        assert_eq!(hidden.error, ErrorCode::AccessDenied);
        assert_eq!(hidden.error_description, "rule execution failed");

        let shown = ProtocolError::from_terminal(&errored, true).unwrap();
        assert_eq!(shown.error_description, "db password wrong");

        let timeout = Terminal::Errored {
            rule: "r".into(),
            message: "timed out".into(),
            cause: ErrorCause::Timeout,
        };
        assert_eq!(
            ProtocolError::from_terminal(&timeout, false).unwrap().error_description,
            "rule execution timed out"
        );

        let completed = Terminal::Completed {
            user: User::new("u"),
            context: Context::new("c", "conn", Protocol::OAuth2),
        };
        assert!(ProtocolError::from_terminal(&completed, false).is_none());
    }

    #[test]
    fn test_redirect_query() {
        let tx = TransactionMetadata::new("X", "db", Protocol::OidcBasicProfile)
            .with_callback("https://app.example.com/cb?keep=1")
            .with_state("xyz");
        let payload = ErrorPayload::build(&ProtocolError::denied("banned client"), &tx).unwrap();
        match payload {
            ErrorPayload::Redirect { location } => {
                let url = Url::parse(&location).unwrap();
                let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
                assert!(pairs.contains(&("keep".into(), "1".into())));
                assert!(pairs.contains(&("error".into(), "unauthorized".into())));
                assert!(pairs.contains(&("error_description".into(), "banned client".into())));
                assert!(pairs.contains(&("state".into(), "xyz".into())));
                assert!(url.fragment().is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_redirect_fragment() {
        let mut tx = TransactionMetadata::new("X", "db", Protocol::OidcImplicitProfile)
            .with_callback("https://app.example.com/cb");
        tx.response_mode = ResponseMode::Fragment;
        match ErrorPayload::build(&ProtocolError::denied("no"), &tx).unwrap() {
            ErrorPayload::Redirect { location } => {
                let url = Url::parse(&location).unwrap();
                assert!(url.query().is_none());
                assert_eq!(url.fragment(), Some("error=unauthorized&error_description=no"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_redirect_requires_callback() {
        let tx = TransactionMetadata::new("X", "db", Protocol::OAuth2);
        assert!(matches!(
            ErrorPayload::build(&ProtocolError::denied("no"), &tx),
            Err(TokenError::MissingCallback(Protocol::OAuth2))
        ));
    }

    #[test]
    fn test_check_delivery_by_transport() {
        let redirect = TransactionMetadata::new("X", "db", Protocol::OidcBasicProfile);
        assert!(matches!(
            ErrorPayload::check_delivery(&redirect),
            Err(TokenError::MissingCallback(Protocol::OidcBasicProfile))
        ));
        assert!(ErrorPayload::check_delivery(
            &redirect.clone().with_callback("https://app.example.com/cb")
        )
        .is_ok());

        let saml = TransactionMetadata::new("X", "db", Protocol::WsFed).with_callback("not a url");
        assert!(matches!(
            ErrorPayload::check_delivery(&saml),
            Err(TokenError::InvalidCallback(_))
        ));

        let direct = TransactionMetadata::new("X", "db", Protocol::OAuth2ResourceOwner);
        assert!(ErrorPayload::check_delivery(&direct).is_ok());
    }

    #[test]
    fn test_saml_assertion_embeds_status() {
        let tx = TransactionMetadata::new("X", "db", Protocol::Samlp)
            .with_callback("https://sp.example.com/acs")
            .with_state("relay");
        match ErrorPayload::build(&ProtocolError::denied("<nope>"), &tx).unwrap() {
            ErrorPayload::Assertion {
                destination,
                saml_response,
                relay_state,
                form,
            } => {
                assert_eq!(destination, "https://sp.example.com/acs");
                let xml = String::from_utf8(STANDARD.decode(&saml_response).unwrap()).unwrap();
                assert!(xml.contains("status:Responder"));
                assert!(xml.contains(
                    "<samlp:StatusMessage>unauthorized: &lt;nope&gt;</samlp:StatusMessage>"
                ));
                assert_eq!(relay_state.as_deref(), Some("relay"));
                assert!(form.contains(&saml_response));
                assert!(form.contains(r#"name="RelayState" value="relay""#));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_direct_protocols_get_json() {
        let tx = TransactionMetadata::new("X", "db", Protocol::OAuth2ResourceOwner);
        match ErrorPayload::build(&ProtocolError::denied("banned"), &tx).unwrap() {
            ErrorPayload::Json { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body["error"], "unauthorized");
                assert_eq!(body["error_description"], "banned");
            }
            other => panic!("unexpected {:?}", other),
        }

        let forbidden = ProtocolError {
            error: ErrorCode::AccessDenied,
            error_description: "rule execution failed".into(),
        };
        assert!(matches!(
            ErrorPayload::build(&forbidden, &tx).unwrap(),
            ErrorPayload::Json { status: 403, .. }
        ));
    }
}
