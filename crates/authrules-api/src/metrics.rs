//! Prometheus metrics served at `/metrics`.
use authrules_core::{RuleTrace, Terminal};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    transactions: IntCounterVec,
    invocations: IntCounterVec,
    rule_latency: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let transactions = IntCounterVec::new(
            Opts::new("authrules_transactions_total", "Transactions by terminal state"),
            &["state"],
        )?;
        let invocations = IntCounterVec::new(
            Opts::new("authrules_rule_invocations_total", "Rule invocations by outcome"),
            &["outcome"],
        )?;
        let rule_latency = HistogramVec::new(
            HistogramOpts::new("authrules_rule_latency_seconds", "Rule invocation latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 20.0]),
            &["rule"],
        )?;

        registry.register(Box::new(transactions.clone()))?;
        registry.register(Box::new(invocations.clone()))?;
        registry.register(Box::new(rule_latency.clone()))?;

        Ok(Self {
            registry,
            transactions,
            invocations,
            rule_latency,
        })
    }

    pub fn observe(&self, terminal: &Terminal, traces: &[RuleTrace]) {
        self.transactions
            .with_label_values(&[terminal.label()])
            .inc();
        for trace in traces {
            self.invocations
                .with_label_values(&[trace.outcome.as_str()])
                .inc();
            self.rule_latency
                .with_label_values(&[trace.rule.as_str()])
                .observe(trace.latency_ms as f64 / 1000.0);
        }
    }

    /// A transaction rejected before any rule ran.
    pub fn observe_rejected(&self) {
        self.transactions.with_label_values(&["rejected"]).inc();
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrules_core::{Context, Protocol, User};

    #[test]
    fn test_observe_and_encode() {
        let metrics = Metrics::new().unwrap();
        let terminal = Terminal::Completed {
            user: User::new("u"),
            context: Context::new("c", "conn", Protocol::OAuth2),
        };
        let trace = RuleTrace {
            rule: "add roles".into(),
            order: 1,
            outcome: "continue".into(),
            context_in: "blake3:a".into(),
            context_out: Some("blake3:b".into()),
            latency_ms: 3,
            diagnostics: 0,
            rejected_signals: 0,
        };
        metrics.observe(&terminal, &[trace]);
        metrics.observe_rejected();

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"authrules_transactions_total{state="completed"} 1"#));
        assert!(text.contains(r#"authrules_transactions_total{state="rejected"} 1"#));
        assert!(text.contains(r#"authrules_rule_invocations_total{outcome="continue"} 1"#));
        assert!(text.contains("authrules_rule_latency_seconds_bucket"));
    }
}
