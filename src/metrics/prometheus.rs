//! Prometheus metrics for tuner observability.
//!
//! Counters work standalone without a Registry - registration is only
//! needed for exposition (scraping).
//!
//! # Design Principles
//!
//! - **Always-on**: Counters are always incremented (just atomic ops)
//! - **Registry optional**: Users can optionally provide a Registry for exposition
//! - **Cached access**: Direct field access, no HashMap lookups in hot paths
//! - **Configurable prefix**: Metric names use `{prefix}_` prefix (default: "nccl_tuner")

use prometheus::{IntCounter, IntGauge, Opts, Registry};

use crate::mab::DecisionMode;

fn counter(prefix: &str, name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(format!("{}_{}", prefix, name), help))
        .expect("metric creation should not fail")
}

fn gauge(prefix: &str, name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(format!("{}_{}", prefix, name), help))
        .expect("metric creation should not fail")
}

/// Prometheus metrics for the tuner.
///
/// Clones share the same underlying counters.
#[derive(Clone)]
pub struct TunerMetrics {
    // === Gauges (current values) ===
    /// Decisions awaiting a report
    pub pending_contexts: IntGauge,

    /// Buckets with learned statistics
    pub tracked_buckets: IntGauge,

    // === Counters (cumulative) ===
    /// Uniform random picks
    pub explore_decisions: IntCounter,

    /// Greedy picks
    pub exploit_decisions: IntCounter,

    /// Forced visits of unvisited arms
    pub sweep_decisions: IntCounter,

    /// Decisions on buckets beyond capacity
    pub untracked_decisions: IntCounter,

    /// Rewards folded into the store
    pub rewards_recorded: IntCounter,

    /// Latency samples dropped as degenerate
    pub rewards_rejected: IntCounter,

    /// Reports with no pending decision
    pub reports_unmatched: IntCounter,

    /// Pending decisions discarded by capacity or TTL
    pub pending_evicted: IntCounter,

    /// Telemetry records dropped because the queue was full or closed
    pub telemetry_dropped: IntCounter,

    /// Telemetry lines that failed to write
    pub telemetry_write_errors: IntCounter,

    /// Feedback lines that could not be parsed
    pub feedback_malformed: IntCounter,
}

impl Default for TunerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TunerMetrics {
    /// Create metrics with default prefix "nccl_tuner".
    pub fn new() -> Self {
        Self::with_prefix("nccl_tuner")
    }

    /// Create metrics with a custom prefix.
    ///
    /// The prefix is sanitized to be a valid Prometheus metric name: hyphens and other
    /// invalid characters are replaced with underscores.
    pub fn with_prefix(prefix: &str) -> Self {
        // Valid chars: [a-zA-Z_:] for first char, [a-zA-Z0-9_:] for rest
        let prefix: String = prefix
            .chars()
            .enumerate()
            .map(|(i, c)| {
                let valid = c.is_ascii_alphabetic()
                    || c == '_'
                    || c == ':'
                    || (i > 0 && c.is_ascii_digit());
                if valid {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let p = prefix.as_str();
        Self {
            pending_contexts: gauge(p, "pending_contexts", "Decisions awaiting a report"),
            tracked_buckets: gauge(p, "tracked_buckets", "Buckets with learned statistics"),
            explore_decisions: counter(p, "explore_decisions", "Uniform random picks"),
            exploit_decisions: counter(p, "exploit_decisions", "Greedy picks"),
            sweep_decisions: counter(p, "sweep_decisions", "Forced visits of unvisited arms"),
            untracked_decisions: counter(
                p,
                "untracked_decisions",
                "Decisions on buckets beyond capacity",
            ),
            rewards_recorded: counter(p, "rewards_recorded", "Rewards folded into the store"),
            rewards_rejected: counter(
                p,
                "rewards_rejected",
                "Latency samples dropped as degenerate",
            ),
            reports_unmatched: counter(p, "reports_unmatched", "Reports with no pending decision"),
            pending_evicted: counter(
                p,
                "pending_evicted",
                "Pending decisions discarded by capacity or TTL",
            ),
            telemetry_dropped: counter(p, "telemetry_dropped", "Telemetry records dropped"),
            telemetry_write_errors: counter(
                p,
                "telemetry_write_errors",
                "Telemetry lines that failed to write",
            ),
            feedback_malformed: counter(
                p,
                "feedback_malformed",
                "Feedback lines that could not be parsed",
            ),
        }
    }

    /// Register all metrics with a Registry for exposition.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate names).
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.pending_contexts.clone()))?;
        registry.register(Box::new(self.tracked_buckets.clone()))?;
        registry.register(Box::new(self.explore_decisions.clone()))?;
        registry.register(Box::new(self.exploit_decisions.clone()))?;
        registry.register(Box::new(self.sweep_decisions.clone()))?;
        registry.register(Box::new(self.untracked_decisions.clone()))?;
        registry.register(Box::new(self.rewards_recorded.clone()))?;
        registry.register(Box::new(self.rewards_rejected.clone()))?;
        registry.register(Box::new(self.reports_unmatched.clone()))?;
        registry.register(Box::new(self.pending_evicted.clone()))?;
        registry.register(Box::new(self.telemetry_dropped.clone()))?;
        registry.register(Box::new(self.telemetry_write_errors.clone()))?;
        registry.register(Box::new(self.feedback_malformed.clone()))?;
        Ok(())
    }

    /// Record a policy decision.
    #[inline]
    pub fn record_decision(&self, mode: DecisionMode) {
        match mode {
            DecisionMode::Explore => self.explore_decisions.inc(),
            DecisionMode::Exploit => self.exploit_decisions.inc(),
            DecisionMode::Sweep => self.sweep_decisions.inc(),
            DecisionMode::Untracked => self.untracked_decisions.inc(),
        }
    }

    /// Total decisions across all modes.
    pub fn total_decisions(&self) -> u64 {
        self.explore_decisions.get()
            + self.exploit_decisions.get()
            + self.sweep_decisions.get()
            + self.untracked_decisions.get()
    }
}

impl std::fmt::Debug for TunerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunerMetrics")
            .field("pending_contexts", &self.pending_contexts.get())
            .field("decisions", &self.total_decisions())
            .field("rewards_recorded", &self.rewards_recorded.get())
            .field("rewards_rejected", &self.rewards_rejected.get())
            .field("reports_unmatched", &self.reports_unmatched.get())
            .finish()
    }
}
