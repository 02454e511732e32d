//! authrules core: data model, context builder and the sequential rule
//! pipeline.
//!
//! ```text
//! Assertion → ContextBuilder → PipelineExecutor ──(each rule)──▶ Sandbox
//!                                   │                              │
//!                                   ▼                              ▼
//!                               Terminal                   InvocationLog
//! ```
//!
//! The executor only depends on the [`Sandbox`] trait; script engines live
//! in their own crates.

pub mod audit;
pub mod completion;
pub mod context;
pub mod data_model;
pub mod error;
pub mod outcome;
pub mod runner;
pub mod sandbox;

pub use audit::{InvocationLog, InvocationLogEntry, InvocationStats};
pub use completion::{
    completion_slot, AlreadySignaled, Completion, CompletionReceiver, CompletionSignal, Waited,
};
pub use context::ContextBuilder;
pub use data_model::{
    ClaimMap, Context, Identity, IdentityAssertion, JsonMap, Protocol, ResponseMode, RuleDefinition,
    TransactionMetadata, Transport, User,
};
pub use error::{ContextBuildError, RulesError};
pub use outcome::{DiagnosticLine, ExecutionOutcome, FailureKind, Invocation};
pub use runner::{
    ErrorCause, PipelineExecutor, PipelineResult, PipelineState, RuleTrace, Terminal, TraceScope,
};
pub use sandbox::{Sandbox, SandboxState};

/// Engine version reported by the service.
pub const AUTHRULES_VERSION: &str = "1.0.0";
