//! Execution outcomes: the single result of one rule invocation
use crate::data_model::{Context, User};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification carried by an error completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The rule deliberately denied the transaction.
    Unauthorized,
    /// Anything else: an error passed to the callback, a parse error or an
    /// uncaught runtime fault.
    Generic,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailureKind::Unauthorized => write!(f, "unauthorized"),
            FailureKind::Generic => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Continue { user: User, context: Context },
    Fail { kind: FailureKind, message: String },
    Timeout,
}

impl ExecutionOutcome {
    pub fn fail(kind: FailureKind, message: impl Into<String>) -> Self {
        ExecutionOutcome::Fail {
            kind,
            message: message.into(),
        }
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, ExecutionOutcome::Continue { .. })
    }

    /// Short outcome label used in traces, logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Continue { .. } => "continue",
            ExecutionOutcome::Fail {
                kind: FailureKind::Unauthorized,
                ..
            } => "unauthorized",
            ExecutionOutcome::Fail {
                kind: FailureKind::Generic,
                ..
            } => "error",
            ExecutionOutcome::Timeout => "timeout",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Fail { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// One captured diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticLine {
    pub at: DateTime<Utc>,
    pub line: String,
}

impl DiagnosticLine {
    pub fn now(line: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            line: line.into(),
        }
    }
}

/// What a sandbox hands back for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub outcome: ExecutionOutcome,
    pub diagnostics: Vec<DiagnosticLine>,
    /// Completion signals raised after the first one, which were ignored.
    pub rejected_signals: u32,
}

impl Invocation {
    pub fn new(outcome: ExecutionOutcome) -> Self {
        Self {
            outcome,
            diagnostics: Vec::new(),
            rejected_signals: 0,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<DiagnosticLine>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::Protocol;

    #[test]
    fn test_labels() {
        let cont = ExecutionOutcome::Continue {
            user: User::new("u"),
            context: Context::new("c", "conn", Protocol::OAuth2),
        };
        assert_eq!(cont.label(), "continue");
        assert!(cont.message().is_none());

        let denied = ExecutionOutcome::fail(FailureKind::Unauthorized, "banned");
        assert_eq!(denied.label(), "unauthorized");
        assert_eq!(denied.message(), Some("banned"));

        assert_eq!(ExecutionOutcome::fail(FailureKind::Generic, "x").label(), "error");
        assert_eq!(ExecutionOutcome::Timeout.label(), "timeout");
    }
}
