//! One authentication transaction, end to end:
//!
//! ```text
//! assertion + metadata → ContextBuilder → snapshot → lease instance
//!     → PipelineExecutor → Completed ? TokenFinalizer : ErrorPayload
//! ```
use crate::config::ServiceConfig;
use crate::metrics::Metrics;
use authrules_core::{
    ContextBuildError, ContextBuilder, IdentityAssertion, InvocationLog, PipelineExecutor,
    RuleTrace, Sandbox, Terminal, TraceScope, TransactionMetadata,
};
use authrules_registry::RuleRegistry;
use authrules_sandbox::{LuaSandbox, SandboxPool};
use authrules_tokens::{ErrorPayload, IssuedTokens, ProtocolError, TokenError, TokenFinalizer};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("CONTEXT/{0}")]
    Context(#[from] ContextBuildError),

    #[error("{0}")]
    Token(#[from] TokenError),
}

/// Exactly one of these per transaction.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TransactionResponse {
    Tokens(IssuedTokens),
    Error {
        error: ProtocolError,
        payload: ErrorPayload,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionReport {
    pub transaction_id: String,
    pub state: &'static str,
    pub rules_digest: String,
    pub traces: Vec<RuleTrace>,
    pub response: TransactionResponse,
}

pub struct RuleEngine {
    builder: ContextBuilder,
    registry: Arc<RuleRegistry>,
    sandbox: Arc<LuaSandbox>,
    pool: SandboxPool,
    executor: PipelineExecutor,
    finalizer: TokenFinalizer,
    expose_rule_errors: bool,
    metrics: Metrics,
}

impl RuleEngine {
    pub fn new(
        config: &ServiceConfig,
        registry: Arc<RuleRegistry>,
        metrics: Metrics,
    ) -> Self {
        let sandbox = Arc::new(
            LuaSandbox::new(config.sandbox.limits.clone())
                .with_configuration(config.configuration.clone()),
        );
        let log = Arc::new(InvocationLog::with_max_entries(config.logs.max_entries));
        Self {
            builder: ContextBuilder::new(),
            registry,
            executor: PipelineExecutor::new(sandbox.clone(), log),
            sandbox,
            pool: SandboxPool::new(config.sandbox.pool.clone()),
            finalizer: TokenFinalizer::new(config.tokens.clone()),
            expose_rule_errors: config.errors.expose_rule_errors,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn log(&self) -> &Arc<InvocationLog> {
        self.executor.log()
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    pub fn finalizer(&self) -> &TokenFinalizer {
        &self.finalizer
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Compile-checks a rule script without running it.
    pub fn check_script(&self, script: &str) -> Result<(), String> {
        self.sandbox.check(script)
    }

    /// Runs one transaction. Inputs are rejected before any rule runs when
    /// the assertion is incomplete or a halt could not be delivered.
    pub async fn authorize(
        &self,
        assertion: &IdentityAssertion,
        transaction: &TransactionMetadata,
    ) -> Result<TransactionReport, EngineError> {
        let (user, context) = match self.builder.build(assertion, transaction) {
            Ok(built) => built,
            Err(e) => {
                self.metrics.observe_rejected();
                tracing::warn!(tenant = %transaction.tenant, error = %e, "assertion rejected");
                return Err(e.into());
            }
        };
        if let Err(e) = ErrorPayload::check_delivery(transaction) {
            self.metrics.observe_rejected();
            tracing::warn!(
                tenant = %transaction.tenant,
                protocol = %transaction.protocol,
                error = %e,
                "transaction rejected"
            );
            return Err(e.into());
        }

        let snapshot = self.registry.list();
        let instance = self.pool.lease();
        let scope = TraceScope::new(&context.tenant);
        tracing::debug!(
            transaction = %scope.transaction_id,
            rules = snapshot.len(),
            digest = %snapshot.digest(),
            instance = %instance.id(),
            "starting rule pipeline"
        );

        let result = self
            .executor
            .run(&scope, &snapshot, user, context, instance.state())
            .await;
        self.metrics.observe(&result.terminal, &result.traces);

        let response = match &result.terminal {
            Terminal::Completed { user, context } => {
                TransactionResponse::Tokens(self.finalizer.issue(user, context, transaction)?)
            }
            Terminal::Denied { message, .. } => {
                self.halt(ProtocolError::denied(message), transaction)?
            }
            Terminal::Errored { message, cause, .. } => self.halt(
                ProtocolError::errored(message, *cause, self.expose_rule_errors),
                transaction,
            )?,
        };

        Ok(TransactionReport {
            transaction_id: result.transaction_id,
            state: result.terminal.label(),
            rules_digest: snapshot.digest(),
            traces: result.traces,
            response,
        })
    }

    fn halt(
        &self,
        error: ProtocolError,
        transaction: &TransactionMetadata,
    ) -> Result<TransactionResponse, EngineError> {
        let payload = ErrorPayload::build(&error, transaction)?;
        Ok(TransactionResponse::Error { error, payload })
    }
}
