//! The whitelist-only global environment a rule script runs in.
//!
//! Besides a safe subset of the Lua standard library, scripts see:
//!
//! - `print(...)` / `log(...)`: captured as diagnostics, never written to stdout
//! - `global`: proxy onto the sandbox instance cache (JSON-compatible values)
//! - `configuration`: read-only copy of the configured rule settings
//! - `UnauthorizedError(message)`: error value that denies the transaction
//!
//! `pcall` and `xpcall` are replaced by versions that re-raise once the
//! invocation deadline has passed, so a script cannot catch its way past it.
use authrules_core::{
    AlreadySignaled, Completion, CompletionSignal, Context, DiagnosticLine, FailureKind,
    SandboxState, User,
};
use mlua::{Function, Lua, LuaSerdeExt, MultiValue, Result as LuaResult, Table, Value};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) const UNAUTHORIZED_ERROR: &str = "UnauthorizedError";
pub(crate) const DEADLINE_EXCEEDED: &str = "execution deadline exceeded";

const SAFE_GLOBALS: &[&str] = &[
    "tostring",
    "tonumber",
    "type",
    "pairs",
    "ipairs",
    "next",
    "select",
    "error",
    "assert",
    "rawget",
    "rawset",
    "rawlen",
    "rawequal",
    "setmetatable",
    "getmetatable",
];

const SAFE_LIBS: &[&str] = &["math", "string", "table"];

const PROTECTED_CALLS: &[&str] = &["pcall", "xpcall"];

/// Diagnostic lines captured during one invocation, capped in bytes.
#[derive(Debug, Clone)]
pub(crate) struct Diagnostics {
    inner: Arc<Mutex<DiagnosticsInner>>,
}

#[derive(Debug)]
struct DiagnosticsInner {
    lines: Vec<DiagnosticLine>,
    bytes: usize,
    max_bytes: usize,
    truncated: bool,
}

impl Diagnostics {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DiagnosticsInner {
                lines: Vec::new(),
                bytes: 0,
                max_bytes,
                truncated: false,
            })),
        }
    }

    pub(crate) fn push(&self, line: impl Into<String>) {
        let line = line.into();
        let mut inner = self.inner.lock();
        if inner.truncated {
            return;
        }
        let len = line.len() + 1;
        if inner.bytes + len > inner.max_bytes {
            inner.truncated = true;
            inner.lines.push(DiagnosticLine::now("[diagnostic output truncated]"));
            return;
        }
        inner.bytes += len;
        inner.lines.push(DiagnosticLine::now(line));
    }

    pub(crate) fn snapshot(&self) -> Vec<DiagnosticLine> {
        self.inner.lock().lines.clone()
    }
}

/// Inputs the environment and callback close over.
pub(crate) struct EnvInputs {
    pub user: User,
    pub context: Context,
    pub state: SandboxState,
    pub signal: CompletionSignal,
    pub diagnostics: Diagnostics,
    pub configuration: Arc<BTreeMap<String, String>>,
    /// Set by the instruction hook once the deadline has passed.
    pub expired: Arc<AtomicBool>,
}

pub(crate) fn build_env(lua: &Lua, inputs: &EnvInputs) -> LuaResult<Table> {
    let env = lua.create_table()?;

    let globals = lua.globals();
    for name in SAFE_GLOBALS.iter().chain(SAFE_LIBS) {
        let value: Value = globals.get(*name)?;
        if !matches!(value, Value::Nil) {
            env.set(*name, value)?;
        }
    }
    for name in PROTECTED_CALLS {
        if let Some(guarded) = deadline_guarded(lua, name, Arc::clone(&inputs.expired))? {
            env.set(*name, guarded)?;
        }
    }

    let diagnostics = inputs.diagnostics.clone();
    let print = lua.create_function(move |lua, args: MultiValue| {
        let line = args
            .iter()
            .map(|v| display(lua, v))
            .collect::<Vec<_>>()
            .join("\t");
        diagnostics.push(line);
        Ok(())
    })?;
    env.set("print", print.clone())?;
    env.set("log", print)?;

    env.set("global", global_proxy(lua, inputs.state.clone())?)?;
    env.set("configuration", lua.to_value(inputs.configuration.as_ref())?)?;

    let unauthorized = lua.create_function(|lua, message: Option<String>| {
        let err = lua.create_table()?;
        err.set("name", UNAUTHORIZED_ERROR)?;
        err.set("message", message.unwrap_or_default())?;
        Ok(err)
    })?;
    env.set(UNAUTHORIZED_ERROR, unauthorized)?;

    Ok(env)
}

/// Wraps the base library's `name` so that it raises instead of returning
/// once `expired` is set. The original function is kept in the registry.
fn deadline_guarded(
    lua: &Lua,
    name: &str,
    expired: Arc<AtomicBool>,
) -> LuaResult<Option<Function>> {
    let Some(inner) = lua.globals().get::<Option<Function>>(name)? else {
        return Ok(None);
    };
    let key = format!("authrules.{name}");
    lua.set_named_registry_value(&key, inner)?;

    let guarded = lua.create_function(move |lua, args: MultiValue| {
        if expired.load(Ordering::Relaxed) {
            return Err(mlua::Error::RuntimeError(DEADLINE_EXCEEDED.to_string()));
        }
        let inner: Function = lua.named_registry_value(&key)?;
        let results: MultiValue = inner.call(args)?;
        if expired.load(Ordering::Relaxed) {
            return Err(mlua::Error::RuntimeError(DEADLINE_EXCEEDED.to_string()));
        }
        Ok(results)
    })?;
    Ok(Some(guarded))
}

/// `global.key` reads from and `global.key = v` writes to the instance
/// cache. Reads return a copy, so nested edits must be written back whole.
fn global_proxy(lua: &Lua, state: SandboxState) -> LuaResult<Table> {
    let proxy = lua.create_table()?;
    let meta = lua.create_table()?;

    let reader = state.clone();
    meta.set(
        "__index",
        lua.create_function(move |lua, (_proxy, key): (Table, String)| {
            match reader.get::<serde_json::Value>(&key) {
                Some(value) => lua.to_value(value.as_ref()),
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    let writer = state;
    meta.set(
        "__newindex",
        lua.create_function(move |lua, (_proxy, key, value): (Table, String, Value)| {
            if matches!(value, Value::Nil) {
                writer.remove(&key);
                return Ok(());
            }
            let json: serde_json::Value = lua.from_value(value).map_err(|e| {
                mlua::Error::RuntimeError(format!(
                    "global.{key} only holds JSON-compatible values: {e}"
                ))
            })?;
            writer.insert(key, json);
            Ok(())
        })?,
    )?;

    proxy.set_metatable(Some(meta));
    Ok(proxy)
}

/// Builds `callback(err, user, context)`.
pub(crate) fn build_callback(lua: &Lua, inputs: &EnvInputs) -> LuaResult<Function> {
    let signal = inputs.signal.clone();
    let diagnostics = inputs.diagnostics.clone();
    let user = inputs.user.clone();
    let context = inputs.context.clone();

    lua.create_function(move |lua, (err, new_user, new_context): (Value, Value, Value)| {
        let completion = if matches!(err, Value::Nil) {
            continue_with(lua, new_user, new_context, &user, &context)
        } else {
            error_completion(lua, &err)
        };
        if let Err(AlreadySignaled) = signal.signal(completion) {
            diagnostics.push("callback called more than once; only the first call counts");
        }
        Ok(())
    })
}

fn continue_with(
    lua: &Lua,
    new_user: Value,
    new_context: Value,
    user: &User,
    context: &Context,
) -> Completion {
    let user = match decode::<User>(lua, new_user, "user") {
        Ok(Some(u)) => u,
        Ok(None) => user.clone(),
        Err(message) => return generic(message),
    };
    let context = match decode::<Context>(lua, new_context, "context") {
        Ok(Some(c)) => c,
        Ok(None) => context.clone(),
        Err(message) => return generic(message),
    };
    Completion::Continue { user, context }
}

fn decode<T: serde::de::DeserializeOwned>(
    lua: &Lua,
    value: Value,
    what: &str,
) -> Result<Option<T>, String> {
    if matches!(value, Value::Nil) {
        return Ok(None);
    }
    let json: serde_json::Value = lua
        .from_value(value)
        .map_err(|e| format!("invalid {what} passed to callback: {e}"))?;
    serde_json::from_value(json)
        .map(Some)
        .map_err(|e| format!("invalid {what} passed to callback: {e}"))
}

fn error_completion(lua: &Lua, err: &Value) -> Completion {
    match err {
        Value::Table(table) => {
            let name: Option<String> = table.get("name").ok();
            let message: Option<String> = table.get("message").ok();
            let message = message.unwrap_or_else(|| "rule error".to_string());
            if name.as_deref() == Some(UNAUTHORIZED_ERROR) {
                Completion::Error {
                    kind: FailureKind::Unauthorized,
                    message,
                }
            } else {
                generic(message)
            }
        }
        other => generic(display(lua, other)),
    }
}

fn generic(message: String) -> Completion {
    Completion::Error {
        kind: FailureKind::Generic,
        message,
    }
}

/// Renders a Lua value for diagnostics; tables are shown as JSON when
/// possible.
pub(crate) fn display(lua: &Lua, value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => format!("{n}"),
        Value::String(s) => s
            .to_str()
            .map_or_else(|_| "<invalid utf8>".into(), |s| s.to_string()),
        Value::Table(_) => lua
            .from_value::<serde_json::Value>(value.clone())
            .map(|json| json.to_string())
            .unwrap_or_else(|_| "<table>".to_string()),
        Value::Function(_) => "<function>".to_string(),
        _ => format!("{value:?}"),
    }
}
