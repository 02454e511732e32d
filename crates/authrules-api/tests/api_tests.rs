use authrules_api::{create_app, AppState, EngineError, ServiceConfig, TransactionResponse};
use authrules_core::{IdentityAssertion, Protocol, TransactionMetadata};
use authrules_tokens::TokenError;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::fs;
use tower::ServiceExt;
use url::Url;

const CALLBACK: &str = "https://app.example.com/callback";

const ROLES_RULE: &str = r#"
function(user, context, callback)
  local roles = { "guest" }
  local suffix = "@admin.example.com"
  if user.email ~= nil and string.sub(user.email, -#suffix) == suffix then
    roles = { "admin", "guest" }
  end
  context.idToken["http://example.com/roles"] = roles
  callback(nil, user, context)
end
"#;

const GUEST_RULE: &str = r#"
function(user, context, callback)
  context.idToken["http://example.com/roles"] = { "guest" }
  callback(nil, user, context)
end
"#;

const ADMIN_RULE: &str = r#"
function(user, context, callback)
  if user.user_id == "auth0|admin" then
    local roles = context.idToken["http://example.com/roles"]
    table.insert(roles, 1, "admin")
    context.idToken["http://example.com/roles"] = roles
  end
  callback(nil, user, context)
end
"#;

const BAN_RULE: &str = r#"
function(user, context, callback)
  if context.clientID == "X" then
    return callback(UnauthorizedError("Access to client X is not allowed"))
  end
  callback(nil, user, context)
end
"#;

fn config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.sandbox.limits.timeout_ms = 300;
    config.sandbox.pool.size = 1;
    config.tokens.issuer = "https://login.example.org/".to_string();
    config
}

fn state(config: &ServiceConfig) -> AppState {
    AppState::from_config(config).unwrap()
}

async fn send(
    app: &Router,
    request: Request<Body>,
) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn create_rule(app: &Router, name: &str, script: &str, order: i64) {
    let (status, _, body) = send(
        app,
        json_request(
            "POST",
            "/v1/rules",
            json!({ "name": name, "script": script, "order": order }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&body));
}

fn authorize_body(client_id: &str, protocol: &str, email: &str) -> Value {
    json!({
        "assertion": { "user_id": "auth0|123", "provider": "auth0", "email": email },
        "transaction": {
            "client_id": client_id,
            "connection": "Username-Password-Authentication",
            "protocol": protocol,
            "callback_url": CALLBACK,
            "state": "af0ifjsldkj"
        }
    })
}

fn authorize_request(client_id: &str, protocol: &str) -> Request<Body> {
    json_request(
        "POST",
        "/v1/authorize",
        authorize_body(client_id, protocol, "a@example.com"),
    )
}

fn assertion(email: &str) -> IdentityAssertion {
    assertion_for("auth0|123", email)
}

fn assertion_for(user_id: &str, email: &str) -> IdentityAssertion {
    IdentityAssertion {
        user_id: Some(user_id.to_string()),
        provider: Some("auth0".to_string()),
        email: Some(email.to_string()),
        ..IdentityAssertion::default()
    }
}

fn redirect_tx(protocol: Protocol) -> TransactionMetadata {
    TransactionMetadata::new("app-1", "Username-Password-Authentication", protocol)
        .with_callback(CALLBACK)
}

fn roles_claim(response: TransactionResponse, state: &AppState) -> Value {
    match response {
        TransactionResponse::Tokens(tokens) => {
            let claim = tokens.id_token_claims["http://example.com/roles"].clone();
            let verified = state
                .engine
                .finalizer()
                .signer()
                .verify(&tokens.id_token)
                .unwrap();
            assert_eq!(verified["http://example.com/roles"], claim);
            claim
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_health() {
    let app = create_app(state(&config()));
    let (status, _, body) = send(&app, get("/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["rules"], 0);
}

#[tokio::test]
async fn test_rule_management() {
    let app = create_app(state(&config()));
    create_rule(&app, "ban client", BAN_RULE, 2).await;

    let (status, _, _) = send(
        &app,
        json_request(
            "POST",
            "/v1/rules",
            json!({ "name": "ban client", "script": BAN_RULE }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, body) = send(
        &app,
        json_request("POST", "/v1/rules", json!({ "name": "-bad", "script": BAN_RULE })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "VALIDATION");

    let (status, _, _) = send(
        &app,
        json_request(
            "POST",
            "/v1/rules",
            json!({ "name": "broken", "script": "function(u, c, cb" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = send(
        &app,
        json_request(
            "PATCH",
            "/v1/rules/ban%20client",
            json!({ "order": 7, "enabled": false }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["order"], 7);
    assert_eq!(body["enabled"], false);

    let (status, _, body) = send(&app, get("/v1/rules")).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["rules"].as_array().unwrap().len(), 1);

    let delete = Request::builder()
        .method("DELETE")
        .uri("/v1/rules/ban%20client")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, delete).await.0, StatusCode::OK);
    assert_eq!(
        send(&app, get("/v1/rules/ban%20client")).await.0,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_roles_scenario() {
    let state = state(&config());
    let registry = state.engine.registry();
    registry.create("grant admin", ADMIN_RULE, Some(2), None).unwrap();
    registry.create("default roles", GUEST_RULE, Some(1), None).unwrap();
    let tx = redirect_tx(Protocol::OidcBasicProfile);

    let report = state
        .engine
        .authorize(&assertion_for("auth0|admin", "root@example.com"), &tx)
        .await
        .unwrap();
    assert_eq!(report.state, "completed");
    assert_eq!(report.traces.len(), 2);
    assert_eq!(report.traces[0].rule, "default roles");
    assert_eq!(roles_claim(report.response, &state), json!(["admin", "guest"]));

    let report = state
        .engine
        .authorize(&assertion_for("auth0|jane", "jane@example.com"), &tx)
        .await
        .unwrap();
    assert_eq!(roles_claim(report.response, &state), json!(["guest"]));
}

#[tokio::test]
async fn test_single_rule_roles_by_email() {
    let state = state(&config());
    state
        .engine
        .registry()
        .create("add roles", ROLES_RULE, None, None)
        .unwrap();
    let tx = redirect_tx(Protocol::OidcBasicProfile);

    for (email, expected) in [
        ("jane@example.com", json!(["guest"])),
        ("root@admin.example.com", json!(["admin", "guest"])),
    ] {
        let report = state.engine.authorize(&assertion(email), &tx).await.unwrap();
        assert_eq!(report.state, "completed");
        assert_eq!(roles_claim(report.response, &state), expected);
    }
}

#[tokio::test]
async fn test_namespaced_claims_survive_and_sub_is_stripped() {
    let state = state(&config());
    state
        .engine
        .registry()
        .create(
            "claims",
            r#"function(user, context, callback)
                 context.idToken["http://mynamespace/hello"] = "world"
                 context.idToken["sub"] = "attacker"
                 callback(nil, user, context)
               end"#,
            None,
            None,
        )
        .unwrap();
    let tx = redirect_tx(Protocol::OidcBasicProfile);

    let report = state
        .engine
        .authorize(&assertion("a@example.com"), &tx)
        .await
        .unwrap();
    match report.response {
        TransactionResponse::Tokens(tokens) => {
            assert_eq!(tokens.id_token_claims["http://mynamespace/hello"], json!("world"));
            assert_eq!(tokens.id_token_claims["sub"], json!("auth0|123"));
            assert_eq!(tokens.stripped.len(), 1);
            assert_eq!(tokens.stripped[0].key, "sub");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_banned_client_redirects_with_error() {
    let app = create_app(state(&config()));
    create_rule(&app, "ban client", BAN_RULE, 1).await;

    let (status, headers, _) = send(&app, authorize_request("X", "oidc-basic-profile")).await;
    assert_eq!(status, StatusCode::FOUND);
    assert!(headers.contains_key("x-authrules-transaction"));

    let location = Url::parse(headers[header::LOCATION].to_str().unwrap()).unwrap();
    let pairs: Vec<(String, String)> = location.query_pairs().into_owned().collect();
    assert!(pairs.contains(&("error".into(), "unauthorized".into())));
    assert!(pairs.contains(&(
        "error_description".into(),
        "Access to client X is not allowed".into()
    )));
    assert!(pairs.contains(&("state".into(), "af0ifjsldkj".into())));
    assert!(!pairs.iter().any(|(k, _)| k.contains("token")));

    // Any other client gets tokens.
    let (status, _, body) = send(&app, authorize_request("Y", "oauth2-resource-owner")).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["token_type"], "Bearer");
    assert!(body["id_token"].as_str().unwrap().split('.').count() == 3);
}

#[tokio::test]
async fn test_saml_denial_posts_form() {
    let app = create_app(state(&config()));
    create_rule(&app, "ban client", BAN_RULE, 1).await;

    let (status, headers, body) = send(&app, authorize_request("X", "samlp")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains(r#"name="SAMLResponse""#));
    assert!(html.contains(r#"action="https://app.example.com/callback""#));
}

#[tokio::test]
async fn test_timeout_halts_with_access_denied() {
    let app = create_app(state(&config()));
    create_rule(
        &app,
        "spin",
        "function(user, context, callback) while true do end end",
        1,
    )
    .await;
    create_rule(&app, "never reached", ROLES_RULE, 2).await;

    let (status, _, body) = send(&app, authorize_request("Y", "oauth2-resource-owner")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "access_denied");
    assert_eq!(body["error_description"], "rule execution timed out");

    let (_, _, body) = send(&app, get("/v1/logs?tenant=default")).await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["rule"], "spin");
    assert_eq!(entries[0]["outcome"], "timeout");
}

#[tokio::test]
async fn test_expose_rule_errors() {
    let mut config = config();
    config.errors.expose_rule_errors = true;
    let app = create_app(state(&config));
    create_rule(
        &app,
        "fails",
        r#"function(u, c, cb) cb("ldap unreachable") end"#,
        1,
    )
    .await;

    let (status, _, body) = send(&app, authorize_request("Y", "oauth2-resource-owner")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error_description"], "ldap unreachable");
}

#[tokio::test]
async fn test_missing_user_id_is_bad_request() {
    let app = create_app(state(&config()));
    let mut body = authorize_body("Y", "oauth2", "a@example.com");
    body["assertion"]["user_id"] = json!("  ");

    let (status, _, body) = send(&app, json_request("POST", "/v1/authorize", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "CONTEXT");
}

#[tokio::test]
async fn test_missing_callback_is_rejected_before_any_rule_runs() {
    let app = create_app(state(&config()));
    create_rule(&app, "ban client", BAN_RULE, 1).await;

    // "Y" would be allowed and "X" denied; neither reaches the pipeline.
    for client in ["Y", "X"] {
        let mut body = authorize_body(client, "oidc-basic-profile", "a@example.com");
        body["transaction"]
            .as_object_mut()
            .unwrap()
            .remove("callback_url");
        let (status, headers, body) =
            send(&app, json_request("POST", "/v1/authorize", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "client {}", client);
        assert!(!headers.contains_key(header::LOCATION));
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "VALIDATION");
    }

    let mut body = authorize_body("X", "samlp", "a@example.com");
    body["transaction"]["callback_url"] = json!("not a url");
    let (status, _, _) = send(&app, json_request("POST", "/v1/authorize", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, _, body) = send(&app, get("/v1/logs")).await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["entries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_engine_rejects_redirect_without_callback() {
    let state = state(&config());
    state
        .engine
        .registry()
        .create("default roles", GUEST_RULE, None, None)
        .unwrap();
    let tx = TransactionMetadata::new("app-1", "db", Protocol::OidcImplicitProfile);

    let err = state
        .engine
        .authorize(&assertion("a@example.com"), &tx)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Token(TokenError::MissingCallback(Protocol::OidcImplicitProfile))
    ));
    assert!(state.engine.log().entries().is_empty());

    // Direct protocols never need one.
    let tx = TransactionMetadata::new("app-1", "db", Protocol::OAuth2ResourceOwner);
    let report = state
        .engine
        .authorize(&assertion("a@example.com"), &tx)
        .await
        .unwrap();
    assert_eq!(report.state, "completed");
}

const CACHE_RULE: &str = r#"
function(user, context, callback)
  local hit = global.client ~= nil
  if not hit then global.client = { ready = true } end
  context.accessToken["http://example.com/cache"] = hit and "hit" or "miss"
  callback(nil, user, context)
end
"#;

async fn cache_status(state: &AppState) -> String {
    let tx = redirect_tx(Protocol::OAuth2);
    let report = state
        .engine
        .authorize(&assertion("a@example.com"), &tx)
        .await
        .unwrap();
    match report.response {
        TransactionResponse::Tokens(tokens) => {
            tokens.access_token_claims["http://example.com/cache"]
                .as_str()
                .unwrap()
                .to_string()
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_sandbox_cache_across_transactions() {
    let state = state(&config());
    state
        .engine
        .registry()
        .create("cache", CACHE_RULE, None, None)
        .unwrap();

    assert_eq!(cache_status(&state).await, "miss");
    assert_eq!(cache_status(&state).await, "hit");

    state.engine.pool().recycle_all();
    assert_eq!(cache_status(&state).await, "miss");
}

#[tokio::test]
async fn test_metrics_and_stats() {
    let app = create_app(state(&config()));
    create_rule(&app, "ban client", BAN_RULE, 1).await;
    send(&app, authorize_request("X", "oauth2-resource-owner")).await;

    let (status, _, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains(r#"authrules_transactions_total{state="denied"} 1"#));
    assert!(text.contains(r#"authrules_rule_invocations_total{outcome="unauthorized"} 1"#));

    let (_, _, body) = send(&app, get("/v1/logs/stats")).await;
    let stats: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["denied"], 1);
}

#[tokio::test]
async fn test_rules_dir_is_loaded_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("roles.lua"), ROLES_RULE).unwrap();
    fs::write(
        dir.path().join("rules.yaml"),
        "- name: add roles\n  order: 1\n  script_file: roles.lua\n",
    )
    .unwrap();

    let mut config = config();
    config.rules_dir = Some(dir.path().to_path_buf());
    let state = state(&config);
    assert_eq!(state.engine.registry().list().names(), vec!["add roles"]);
}
