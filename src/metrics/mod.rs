//! Metrics collection for tuner observability.
//!
//! Metrics are always collected (atomic operations) and can optionally be
//! exposed via a Prometheus registry passed to the builder.
//!
//! # Available Metrics
//!
//! ## Gauges (current values)
//!
//! - `nccl_tuner_pending_contexts` - Decisions awaiting a report
//! - `nccl_tuner_tracked_buckets` - Buckets with learned statistics
//!
//! ## Counters (cumulative)
//!
//! - `nccl_tuner_{explore,exploit,sweep,untracked}_decisions` - Decisions by mode
//! - `nccl_tuner_rewards_recorded` - Rewards folded into the store
//! - `nccl_tuner_rewards_rejected` - Degenerate latency samples dropped
//! - `nccl_tuner_reports_unmatched` - Duplicate or unknown reports ignored
//! - `nccl_tuner_pending_evicted` - Unreported decisions discarded
//! - `nccl_tuner_telemetry_dropped` - Reward log records dropped
//! - `nccl_tuner_telemetry_write_errors` - Reward log write failures
//! - `nccl_tuner_feedback_malformed` - Unparsable feedback lines
//!
//! # Example
//!
//! ```ignore
//! use prometheus::{Registry, TextEncoder};
//! use nccl_bandit_tuner::TunerBuilder;
//!
//! let registry = Registry::new();
//! let tuner = TunerBuilder::new()
//!     .prometheus_registry(registry.clone())
//!     .build()?;
//!
//! let mut buffer = String::new();
//! TextEncoder::new().encode_utf8(&registry.gather(), &mut buffer)?;
//! ```

mod prometheus;

pub use self::prometheus::TunerMetrics;
