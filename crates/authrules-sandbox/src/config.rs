//! Sandbox limits
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock budget for one invocation.
    pub timeout_ms: u64,
    /// Lua VM allocation cap.
    pub memory_limit_bytes: usize,
    /// How often (in VM instructions) the deadline is checked.
    pub instruction_interval: u32,
    /// Cap on captured diagnostic output per invocation.
    pub max_diagnostic_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            memory_limit_bytes: 16 * 1024 * 1024,
            instruction_interval: 1_000,
            max_diagnostic_bytes: 32_768,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// When the pool throws an instance (and its cache) away.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
    pub recycle_after_invocations: u64,
    pub recycle_after_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            recycle_after_invocations: 1_000,
            recycle_after_secs: 600,
        }
    }
}
