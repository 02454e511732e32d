//! Sandbox instance pool
//!
//! A fixed set of instances, each owning one [`SandboxState`]. Transactions
//! lease instances round-robin; an instance that has served too many
//! invocations or lived too long is replaced by a fresh one with an empty
//! cache.
use crate::config::PoolConfig;
use authrules_core::SandboxState;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug)]
pub struct SandboxInstance {
    id: Uuid,
    state: SandboxState,
    created: Instant,
    leases: AtomicU64,
}

impl SandboxInstance {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SandboxState::new(),
            created: Instant::now(),
            leases: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &SandboxState {
        &self.state
    }

    pub fn leases(&self) -> u64 {
        self.leases.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    fn is_spent(&self, config: &PoolConfig) -> bool {
        self.leases() >= config.recycle_after_invocations
            || self.age() >= Duration::from_secs(config.recycle_after_secs)
    }
}

/// Point-in-time view of one pool slot.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub slot: usize,
    pub id: Uuid,
    pub leases: u64,
    pub age_secs: u64,
    pub cached_entries: usize,
}

#[derive(Debug)]
pub struct SandboxPool {
    slots: Vec<RwLock<Arc<SandboxInstance>>>,
    next: AtomicUsize,
    config: PoolConfig,
}

impl SandboxPool {
    pub fn new(config: PoolConfig) -> Self {
        let size = config.size.max(1);
        Self {
            slots: (0..size)
                .map(|_| RwLock::new(Arc::new(SandboxInstance::new())))
                .collect(),
            next: AtomicUsize::new(0),
            config,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Picks the next instance, recycling it first if it is spent.
    pub fn lease(&self) -> Arc<SandboxInstance> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let slot = &self.slots[index];

        {
            let current = slot.read();
            if !current.is_spent(&self.config) {
                current.leases.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(&current);
            }
        }

        let mut current = slot.write();
        // Another lease may have recycled it while we waited for the lock.
        if current.is_spent(&self.config) {
            tracing::debug!(
                slot = index,
                instance = %current.id,
                leases = current.leases(),
                "recycling sandbox instance"
            );
            *current = Arc::new(SandboxInstance::new());
        }
        current.leases.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&current)
    }

    /// Replaces the instance in `slot`. Returns false for an unknown slot.
    pub fn recycle(&self, slot: usize) -> bool {
        match self.slots.get(slot) {
            Some(lock) => {
                *lock.write() = Arc::new(SandboxInstance::new());
                true
            }
            None => false,
        }
    }

    pub fn recycle_all(&self) {
        for slot in 0..self.slots.len() {
            self.recycle(slot);
        }
        tracing::info!(instances = self.slots.len(), "recycled all sandbox instances");
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.slots
            .iter()
            .enumerate()
            .map(|(slot, lock)| {
                let instance = lock.read();
                InstanceInfo {
                    slot,
                    id: instance.id,
                    leases: instance.leases(),
                    age_secs: instance.age().as_secs(),
                    cached_entries: instance.state.len(),
                }
            })
            .collect()
    }
}

impl Default for SandboxPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
