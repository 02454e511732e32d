//! Lua rule runtime
//!
//! Every invocation gets a fresh Lua VM on the blocking pool, with a memory
//! cap and an instruction hook that enforces the wall-clock deadline. The
//! only state that survives between invocations is the [`SandboxState`]
//! the caller passes in.
use crate::config::SandboxConfig;
use crate::env::{build_callback, build_env, Diagnostics, EnvInputs, DEADLINE_EXCEEDED};
use crate::error::{format_lua_error, SandboxError};
use async_trait::async_trait;
use authrules_core::{
    completion_slot, Context, ExecutionOutcome, FailureKind, Invocation, RuleDefinition, Sandbox,
    SandboxState, User, Waited,
};
use mlua::{HookTriggers, Lua, LuaSerdeExt, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Rules are written as a bare function expression; the loader returns it.
pub(crate) fn chunk_source(script: &str) -> String {
    if script.trim_start().starts_with("return") {
        script.to_string()
    } else {
        format!("return {script}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct LuaSandbox {
    config: SandboxConfig,
    configuration: Arc<BTreeMap<String, String>>,
}

impl LuaSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            configuration: Arc::new(BTreeMap::new()),
        }
    }

    /// Key/value settings exposed to every rule as `configuration`.
    pub fn with_configuration(mut self, configuration: BTreeMap<String, String>) -> Self {
        self.configuration = Arc::new(configuration);
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

#[async_trait]
impl Sandbox for LuaSandbox {
    fn check(&self, script: &str) -> Result<(), String> {
        let lua = Lua::new();
        lua.load(chunk_source(script))
            .set_name("=check")
            .into_function()
            .map(|_| ())
            .map_err(|e| SandboxError::Compile(format_lua_error(&e)).to_string())
    }

    async fn invoke(
        &self,
        rule: &RuleDefinition,
        user: &User,
        context: &Context,
        state: &SandboxState,
    ) -> Invocation {
        let timeout = self.config.timeout();
        let (signal, mut receiver) = completion_slot();
        let expired = Arc::new(AtomicBool::new(false));
        let diagnostics = Diagnostics::new(self.config.max_diagnostic_bytes);

        let inputs = EnvInputs {
            user: user.clone(),
            context: context.clone(),
            state: state.clone(),
            signal,
            diagnostics: diagnostics.clone(),
            configuration: Arc::clone(&self.configuration),
            expired,
        };
        let config = self.config.clone();
        let name = rule.name.clone();
        let script = rule.script.clone();
        let deadline = Instant::now() + timeout;

        let mut handle =
            tokio::task::spawn_blocking(move || execute(&config, &name, &script, inputs, deadline));

        let outcome = match receiver.wait(timeout).await {
            Waited::Signaled(completion) => {
                // Let the script finish so late signals and output are counted.
                let remaining = deadline.saturating_duration_since(Instant::now());
                let _ = tokio::time::timeout(remaining, &mut handle).await;
                completion.into()
            }
            Waited::DeadlineElapsed => ExecutionOutcome::Timeout,
            Waited::Abandoned => match handle.await {
                Ok(Ok(())) => {
                    diagnostics.push("rule returned without calling callback");
                    ExecutionOutcome::Timeout
                }
                Ok(Err(SandboxError::DeadlineExceeded)) => ExecutionOutcome::Timeout,
                Ok(Err(e)) => ExecutionOutcome::fail(FailureKind::Generic, e.to_string()),
                Err(join) => ExecutionOutcome::fail(
                    FailureKind::Generic,
                    format!("rule execution aborted: {join}"),
                ),
            },
        };

        if matches!(outcome, ExecutionOutcome::Timeout) {
            tracing::warn!(
                rule = %rule.name,
                timeout_ms = self.config.timeout_ms,
                "rule timed out"
            );
        }

        Invocation {
            outcome,
            diagnostics: diagnostics.snapshot(),
            rejected_signals: receiver.rejected(),
        }
    }
}

/// Runs on the blocking pool. Returns once the rule function returns or
/// faults; the outcome itself travels through the completion signal.
fn execute(
    config: &SandboxConfig,
    name: &str,
    script: &str,
    inputs: EnvInputs,
    deadline: Instant,
) -> Result<(), SandboxError> {
    let lua = Lua::new();
    lua.set_memory_limit(config.memory_limit_bytes)
        .map_err(|e| SandboxError::Setup(format_lua_error(&e)))?;

    let env = build_env(&lua, &inputs).map_err(|e| SandboxError::Setup(format_lua_error(&e)))?;
    let callback =
        build_callback(&lua, &inputs).map_err(|e| SandboxError::Setup(format_lua_error(&e)))?;

    let expired = Arc::clone(&inputs.expired);
    let flag = Arc::clone(&expired);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(config.instruction_interval.max(1)),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                flag.store(true, Ordering::Relaxed);
                return Err(mlua::Error::RuntimeError(DEADLINE_EXCEEDED.to_string()));
            }
            Ok(mlua::VmState::Continue)
        },
    );

    let to_sandbox_error = |e: mlua::Error| {
        if expired.load(Ordering::Relaxed) {
            SandboxError::DeadlineExceeded
        } else {
            SandboxError::Runtime(format_lua_error(&e))
        }
    };

    let value: Value = lua
        .load(chunk_source(script))
        .set_name(format!("={name}"))
        .set_environment(env)
        .eval()
        .map_err(|e| match e {
            mlua::Error::SyntaxError { .. } => SandboxError::Compile(format_lua_error(&e)),
            other => to_sandbox_error(other),
        })?;
    let Value::Function(rule_fn) = value else {
        return Err(SandboxError::NotAFunction);
    };

    let user = lua
        .to_value(&inputs.user)
        .map_err(|e| SandboxError::Setup(format_lua_error(&e)))?;
    let context = lua
        .to_value(&inputs.context)
        .map_err(|e| SandboxError::Setup(format_lua_error(&e)))?;
    // Only the Lua callback keeps the signal alive past this point, so the
    // receiver sees `Abandoned` as soon as the VM is gone.
    drop(inputs);

    let result = rule_fn.call::<()>((user, context, callback)).map_err(to_sandbox_error);
    lua.remove_hook();
    result
}
