//! Sandbox contract and the per-instance cache rules may use.
use crate::data_model::{Context, RuleDefinition, User};
use crate::outcome::Invocation;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type CachedObject = Arc<dyn Any + Send + Sync>;

/// Opaque key → object cache that lives exactly as long as one sandbox
/// instance.
///
/// Nothing here is durable: the host may recycle the instance at any time,
/// so every reader must handle a miss and repopulate. Concurrent
/// repopulation is last-writer-wins.
#[derive(Clone, Default)]
pub struct SandboxState {
    entries: Arc<RwLock<HashMap<String, CachedObject>>>,
}

impl SandboxState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value if present and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entry = self.entries.read().get(key).cloned()?;
        entry.downcast::<T>().ok()
    }

    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Arc<T> {
        let value = Arc::new(value);
        let erased: CachedObject = value.clone();
        self.entries.write().insert(key.into(), erased);
        value
    }

    /// Read, check presence, populate if absent.
    ///
    /// `init` runs without holding the lock; a concurrent populate of the
    /// same key simply overwrites.
    pub fn get_or_insert_with<T, F>(&self, key: &str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(hit) = self.get::<T>(key) {
            return hit;
        }
        self.insert(key, init())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl fmt::Debug for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let entries = self.entries.read();
        let mut keys: Vec<_> = entries.keys().collect();
        keys.sort();
        f.debug_struct("SandboxState").field("keys", &keys).finish()
    }
}

/// Runs one rule against one `(user, context)` pair.
///
/// Implementations own the deadline and resource limits. They must return
/// exactly one outcome, and a non-`Continue` outcome must leave the caller's
/// `context` untouched (inputs are borrowed for that reason).
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Checks that a script compiles without running it.
    fn check(&self, _script: &str) -> Result<(), String> {
        Ok(())
    }

    async fn invoke(
        &self,
        rule: &RuleDefinition,
        user: &User,
        context: &Context,
        state: &SandboxState,
    ) -> Invocation;
}
