//! Lua execution sandbox for authentication rules.
//!
//! [`LuaSandbox`] implements [`authrules_core::Sandbox`]: a rule is a Lua
//! function `function(user, context, callback)` that must call
//! `callback(err, user, context)` exactly once before its deadline.
//! [`SandboxPool`] owns the per-instance caches rules reach through
//! `global`.

pub mod config;
mod env;
pub mod error;
pub mod lua;
pub mod pool;

pub use config::{PoolConfig, SandboxConfig};
pub use error::SandboxError;
pub use lua::LuaSandbox;
pub use pool::{InstanceInfo, SandboxInstance, SandboxPool};
