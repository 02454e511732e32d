//! Sandbox-internal faults. All of them end up as a generic rule error,
//! except `DeadlineExceeded`, which becomes a timeout.
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("{0}")]
    Runtime(String),

    #[error("script must evaluate to a function(user, context, callback)")]
    NotAFunction,

    #[error("execution deadline exceeded")]
    DeadlineExceeded,

    #[error("sandbox setup failed: {0}")]
    Setup(String),
}

/// Flattens mlua's nested callback errors into the message a rule author
/// wants to see.
pub(crate) fn format_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::MemoryError(msg) => format!("memory limit exceeded: {msg}"),
        _ => format!("{err}"),
    }
}
