//! API Handlers
use crate::engine::{EngineError, TransactionResponse};
use crate::AppState;
use authrules_core::{IdentityAssertion, RulesError, TransactionMetadata, AUTHRULES_VERSION};
use authrules_registry::RuleUpdate;
use authrules_tokens::{ErrorPayload, TokenError};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

pub const TRANSACTION_HEADER: &str = "x-authrules-transaction";

type ApiResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

fn rules_error(err: RulesError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        RulesError::Validation(_) | RulesError::ContextBuild(_) => StatusCode::BAD_REQUEST,
        RulesError::DuplicateName(_) => StatusCode::CONFLICT,
        RulesError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = err.to_string();
    let (code, description) = message.split_once('/').unwrap_or(("ERROR", message.as_str()));
    (status, Json(json!({ "error": code, "error_description": description })))
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let engine = &state.engine;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": AUTHRULES_VERSION,
            "rules": engine.registry().len(),
            "enabled_rules": engine.registry().list().len(),
            "sandbox_instances": engine.pool().size(),
            "started_at": state.started_at.to_rfc3339(),
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct CreateRule {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

pub async fn list_rules(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let rules = state.engine.registry().all();
    (StatusCode::OK, Json(json!({ "rules": rules })))
}

pub async fn create_rule(State(state): State<AppState>, Json(body): Json<CreateRule>) -> ApiResult {
    state
        .engine
        .check_script(&body.script)
        .map_err(|e| rules_error(RulesError::Validation(e)))?;
    let rule = state
        .engine
        .registry()
        .create(body.name, body.script, body.order, body.enabled)
        .map_err(|e| rules_error(e.into()))?;
    Ok((StatusCode::CREATED, Json(json!(rule))))
}

pub async fn get_rule(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state
        .engine
        .registry()
        .get(&name)
        .map(|rule| (StatusCode::OK, Json(json!(rule))))
        .ok_or_else(|| rules_error(RulesError::NotFound(name)))
}

pub async fn update_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<RuleUpdate>,
) -> ApiResult {
    if let Some(script) = &update.script {
        state
            .engine
            .check_script(script)
            .map_err(|e| rules_error(RulesError::Validation(e)))?;
    }
    let rule = state
        .engine
        .registry()
        .update(&name, update)
        .map_err(|e| rules_error(e.into()))?;
    Ok((StatusCode::OK, Json(json!(rule))))
}

pub async fn delete_rule(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let removed = state
        .engine
        .registry()
        .delete(&name)
        .map_err(|e| rules_error(e.into()))?;
    Ok((StatusCode::OK, Json(json!({ "deleted": removed.name }))))
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub assertion: IdentityAssertion,
    pub transaction: TransactionMetadata,
}

/// Runs one transaction and answers the way the protocol expects.
pub async fn authorize(
    State(state): State<AppState>,
    Json(request): Json<AuthorizeRequest>,
) -> Response {
    let report = match state
        .engine
        .authorize(&request.assertion, &request.transaction)
        .await
    {
        Ok(report) => report,
        Err(EngineError::Context(e)) => return rules_error(e.into()).into_response(),
        Err(EngineError::Token(
            e @ (TokenError::MissingCallback(_) | TokenError::InvalidCallback(_)),
        )) => return rules_error(RulesError::Validation(e.to_string())).into_response(),
        Err(EngineError::Token(e)) => {
            tracing::error!(error = %e, "token finalization failed");
            return rules_error(RulesError::Serialize(e.to_string())).into_response();
        }
    };

    let mut response = match report.response {
        TransactionResponse::Tokens(tokens) => (
            StatusCode::OK,
            Json(json!({
                "id_token": tokens.id_token,
                "access_token": tokens.access_token,
                "token_type": tokens.token_type,
                "expires_in": tokens.expires_in,
            })),
        )
            .into_response(),
        TransactionResponse::Error { payload, .. } => match payload {
            ErrorPayload::Redirect { location } => {
                (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
            }
            ErrorPayload::Assertion { form, .. } => (StatusCode::OK, Html(form)).into_response(),
            ErrorPayload::Json { status, body } => (
                StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN),
                Json(body),
            )
                .into_response(),
        },
    };

    if let Ok(value) = HeaderValue::from_str(&report.transaction_id) {
        response.headers_mut().insert(TRANSACTION_HEADER, value);
    }
    response
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub tenant: Option<String>,
    pub transaction: Option<String>,
    /// Unix milliseconds.
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

pub async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> (StatusCode, Json<Value>) {
    let log = state.engine.log();
    let mut entries = match query.since {
        Some(since) => log.entries_since(since),
        None => log.entries(),
    };
    if let Some(tenant) = &query.tenant {
        entries.retain(|e| &e.tenant == tenant);
    }
    if let Some(transaction) = &query.transaction {
        entries.retain(|e| &e.transaction_id == transaction);
    }
    if let Some(limit) = query.limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }
    (StatusCode::OK, Json(json!({ "entries": entries })))
}

pub async fn log_stats(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!(state.engine.log().stats())))
}

pub async fn sandbox_instances(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({ "instances": state.engine.pool().instances() })),
    )
}

pub async fn recycle_sandboxes(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    state.engine.pool().recycle_all();
    (
        StatusCode::OK,
        Json(json!({ "recycled": state.engine.pool().size() })),
    )
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.engine.metrics().encode() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
