//! Invocation log
//!
//! Every rule invocation produces one entry: its diagnostic lines plus the
//! terminal outcome. Entries are kept in a bounded ring, pushed to live
//! subscribers, and mirrored to `tracing`. None of this touches the
//! authentication response.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

/// One rule invocation as seen by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationLogEntry {
    /// Unique entry ID
    pub id: String,

    /// Timestamp (Unix ms)
    pub timestamp: u64,

    /// Account/container the transaction belongs to
    pub tenant: String,

    pub transaction_id: String,

    pub rule: String,

    pub order: i64,

    /// `continue`, `unauthorized`, `error` or `timeout`
    pub outcome: String,

    /// Failure message, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default)]
    pub diagnostics: Vec<String>,

    pub latency_ms: u64,

    #[serde(default)]
    pub rejected_signals: u32,
}

impl InvocationLogEntry {
    pub fn new(
        tenant: impl Into<String>,
        transaction_id: impl Into<String>,
        rule: impl Into<String>,
        order: i64,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_entry_id(),
            timestamp: current_timestamp(),
            tenant: tenant.into(),
            transaction_id: transaction_id.into(),
            rule: rule.into(),
            order,
            outcome: outcome.into(),
            message: None,
            diagnostics: Vec::new(),
            latency_ms: 0,
            rejected_signals: 0,
        }
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<String>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_rejected_signals(mut self, rejected: u32) -> Self {
        self.rejected_signals = rejected;
        self
    }

    fn emit_trace(&self) {
        for line in &self.diagnostics {
            tracing::debug!(
                tenant = %self.tenant,
                transaction = %self.transaction_id,
                rule = %self.rule,
                "rule log: {}",
                line
            );
        }
        let message = self.message.as_deref().unwrap_or("");
        match self.outcome.as_str() {
            "continue" => tracing::debug!(
                tenant = %self.tenant,
                rule = %self.rule,
                latency_ms = self.latency_ms,
                "rule continued"
            ),
            "unauthorized" => tracing::info!(
                tenant = %self.tenant,
                rule = %self.rule,
                reason = message,
                "rule denied transaction"
            ),
            _ => tracing::warn!(
                tenant = %self.tenant,
                rule = %self.rule,
                outcome = %self.outcome,
                reason = message,
                "rule failed"
            ),
        }
        if self.rejected_signals > 0 {
            tracing::warn!(
                rule = %self.rule,
                rejected = self.rejected_signals,
                "rule raised its completion signal more than once"
            );
        }
    }
}

/// Bounded log collector with live fan-out.
pub struct InvocationLog {
    entries: Mutex<VecDeque<InvocationLogEntry>>,
    max_entries: usize,
    live: broadcast::Sender<InvocationLogEntry>,
}

impl InvocationLog {
    pub fn new() -> Self {
        Self::with_max_entries(10_000)
    }

    pub fn with_max_entries(max: usize) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_entries: max.max(1),
            live,
        }
    }

    pub fn record(&self, entry: InvocationLogEntry) {
        entry.emit_trace();
        // No subscribers is fine.
        let _ = self.live.send(entry.clone());

        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    /// Live stream of entries recorded from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<InvocationLogEntry> {
        self.live.subscribe()
    }

    pub fn entries(&self) -> Vec<InvocationLogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn entries_since(&self, timestamp: u64) -> Vec<InvocationLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.timestamp >= timestamp)
            .cloned()
            .collect()
    }

    pub fn entries_for_tenant(&self, tenant: &str) -> Vec<InvocationLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.tenant == tenant)
            .cloned()
            .collect()
    }

    pub fn entries_for_transaction(&self, transaction_id: &str) -> Vec<InvocationLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Export to JSON Lines
    pub fn to_jsonl(&self) -> String {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn stats(&self) -> InvocationStats {
        let entries = self.entries.lock();
        let count = |outcome: &str| entries.iter().filter(|e| e.outcome == outcome).count();
        InvocationStats {
            total: entries.len(),
            continued: count("continue"),
            denied: count("unauthorized"),
            errored: count("error"),
            timed_out: count("timeout"),
        }
    }
}

impl Default for InvocationLog {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationStats {
    pub total: usize,
    pub continued: usize,
    pub denied: usize,
    pub errored: usize,
    pub timed_out: usize,
}

fn generate_entry_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let timestamp = current_timestamp();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("inv_{:x}_{:04x}", timestamp, counter % 0xFFFF)
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
