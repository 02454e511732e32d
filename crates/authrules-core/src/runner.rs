//! Pipeline Executor: runs a rule snapshot strictly in sequence, threading
//! the `(user, context)` pair through each invocation.
use crate::audit::{InvocationLog, InvocationLogEntry};
use crate::data_model::{Context, RuleDefinition, User};
use crate::error::RulesError;
use crate::outcome::{ExecutionOutcome, FailureKind};
use crate::sandbox::{Sandbox, SandboxState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Why a pipeline ended in `Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    /// Error passed to the callback, parse error or runtime fault.
    Script,
    Timeout,
}

/// Absorbing end states of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Completed { user: User, context: Context },
    Denied { rule: String, message: String },
    Errored { rule: String, message: String, cause: ErrorCause },
}

impl Terminal {
    pub fn label(&self) -> &'static str {
        match self {
            Terminal::Completed { .. } => "completed",
            Terminal::Denied { .. } => "denied",
            Terminal::Errored { .. } => "errored",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Terminal::Completed { .. })
    }

    pub fn into_result(self) -> Result<(User, Context), RulesError> {
        match self {
            Terminal::Completed { user, context } => Ok((user, context)),
            Terminal::Denied { message, .. } => Err(RulesError::Unauthorized(message)),
            Terminal::Errored {
                message,
                cause: ErrorCause::Timeout,
                ..
            } => Err(RulesError::Timeout(message)),
            Terminal::Errored { message, .. } => Err(RulesError::Generic(message)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Running { user: User, context: Context },
    Done(Terminal),
}

impl PipelineState {
    pub fn start(user: User, context: Context) -> Self {
        PipelineState::Running { user, context }
    }

    /// Applies one invocation outcome. Terminal states ignore further input.
    pub fn advance(self, rule: &str, outcome: ExecutionOutcome) -> Self {
        if let PipelineState::Done(_) = self {
            return self;
        }
        match outcome {
            ExecutionOutcome::Continue { user, context } => {
                PipelineState::Running { user, context }
            }
            ExecutionOutcome::Fail {
                kind: FailureKind::Unauthorized,
                message,
            } => PipelineState::Done(Terminal::Denied {
                rule: rule.to_string(),
                message,
            }),
            ExecutionOutcome::Fail {
                kind: FailureKind::Generic,
                message,
            } => PipelineState::Done(Terminal::Errored {
                rule: rule.to_string(),
                message,
                cause: ErrorCause::Script,
            }),
            ExecutionOutcome::Timeout => PipelineState::Done(Terminal::Errored {
                rule: rule.to_string(),
                message: format!("rule '{}' timed out", rule),
                cause: ErrorCause::Timeout,
            }),
        }
    }

    /// Called when no rules remain.
    pub fn finish(self) -> Terminal {
        match self {
            PipelineState::Running { user, context } => Terminal::Completed { user, context },
            PipelineState::Done(terminal) => terminal,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running { .. })
    }
}

/// Per-rule record of what happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTrace {
    pub rule: String,
    pub order: i64,
    pub outcome: String,
    pub context_in: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_out: Option<String>,
    pub latency_ms: u64,
    pub diagnostics: usize,
    pub rejected_signals: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub transaction_id: String,
    pub terminal: Terminal,
    pub traces: Vec<RuleTrace>,
}

/// Identifies a transaction for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceScope {
    pub tenant: String,
    pub transaction_id: String,
}

impl TraceScope {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            transaction_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

pub struct PipelineExecutor {
    sandbox: Arc<dyn Sandbox>,
    log: Arc<InvocationLog>,
}

impl PipelineExecutor {
    pub fn new(sandbox: Arc<dyn Sandbox>, log: Arc<InvocationLog>) -> Self {
        Self { sandbox, log }
    }

    pub fn log(&self) -> &Arc<InvocationLog> {
        &self.log
    }

    /// Runs `rules` in the order given; callers pass a ranked snapshot.
    ///
    /// Each invocation is awaited before the next starts, so a rule sees
    /// exactly the mutations of the rules before it that continued.
    pub async fn run<'r, I>(
        &self,
        scope: &TraceScope,
        rules: I,
        user: User,
        context: Context,
        state: &SandboxState,
    ) -> PipelineResult
    where
        I: IntoIterator<Item = &'r RuleDefinition>,
    {
        let mut pipeline = PipelineState::start(user, context);
        let mut traces = Vec::new();

        for rule in rules {
            let (user, context) = match &pipeline {
                PipelineState::Running { user, context } => (user, context),
                PipelineState::Done(_) => break,
            };

            let start = Instant::now();
            let context_in = digest(context);
            let invocation = self.sandbox.invoke(rule, user, context, state).await;
            let latency_ms = start.elapsed().as_millis() as u64;

            let context_out = match &invocation.outcome {
                ExecutionOutcome::Continue { context, .. } => Some(digest(context)),
                _ => None,
            };
            let outcome = invocation.outcome.label();

            traces.push(RuleTrace {
                rule: rule.name.clone(),
                order: rule.order,
                outcome: outcome.to_string(),
                context_in,
                context_out,
                latency_ms,
                diagnostics: invocation.diagnostics.len(),
                rejected_signals: invocation.rejected_signals,
            });

            self.log.record(
                InvocationLogEntry::new(
                    &scope.tenant,
                    &scope.transaction_id,
                    &rule.name,
                    rule.order,
                    outcome,
                )
                .with_message(invocation.outcome.message().map(str::to_string))
                .with_diagnostics(
                    invocation
                        .diagnostics
                        .iter()
                        .map(|d| d.line.clone())
                        .collect(),
                )
                .with_latency(latency_ms)
                .with_rejected_signals(invocation.rejected_signals),
            );

            pipeline = pipeline.advance(&rule.name, invocation.outcome);
        }

        let terminal = pipeline.finish();
        tracing::info!(
            tenant = %scope.tenant,
            transaction = %scope.transaction_id,
            rules_run = traces.len(),
            state = terminal.label(),
            "rule pipeline finished"
        );

        PipelineResult {
            transaction_id: scope.transaction_id.clone(),
            terminal,
            traces,
        }
    }
}

fn digest(context: &Context) -> String {
    let bytes = serde_json::to_vec(context).unwrap_or_default();
    format!("blake3:{}", blake3::hash(&bytes))
}
