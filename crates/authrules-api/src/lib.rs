//! authrules API /v1: rule management, transactions, logs and metrics
pub mod config;
pub mod engine;
pub mod handlers;
pub mod metrics;
pub mod middleware;

pub use config::{ConfigError, ServiceConfig};
pub use engine::{EngineError, RuleEngine, TransactionReport, TransactionResponse};
pub use metrics::Metrics;

use anyhow::Context as _;
use authrules_registry::RuleRegistry;
use axum::{
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RuleEngine>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Builds the engine and loads `rules_dir`, if configured.
    pub fn from_config(config: &ServiceConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(RuleRegistry::new());
        if let Some(dir) = &config.rules_dir {
            registry
                .load_dir(dir)
                .with_context(|| format!("loading rules from {}", dir.display()))?;
        }
        let metrics = Metrics::new().context("registering metrics")?;
        Ok(Self {
            engine: Arc::new(RuleEngine::new(config, registry, metrics)),
            started_at: Utc::now(),
        })
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(handlers::health))
        .route("/v1/rules", get(handlers::list_rules).post(handlers::create_rule))
        .route(
            "/v1/rules/{name}",
            get(handlers::get_rule)
                .patch(handlers::update_rule)
                .delete(handlers::delete_rule),
        )
        .route("/v1/authorize", post(handlers::authorize))
        .route("/v1/logs", get(handlers::logs))
        .route("/v1/logs/stats", get(handlers::log_stats))
        .route("/v1/sandbox/instances", get(handlers::sandbox_instances))
        .route("/v1/sandbox/recycle", post(handlers::recycle_sandboxes))
        .route("/metrics", get(handlers::metrics))
        .layer(middleware::cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: ServiceConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config)?;
    let rules = state.engine.registry().len();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    tracing::info!(addr = %config.listen_addr, rules, "authrules API listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
