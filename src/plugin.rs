//! The tuner lifecycle: initialize, decide, report, destroy.
//!
//! [`TunerPlugin`] is the capability the host adapter drives. [`BanditTuner`]
//! implements it as a three-state machine:
//!
//! ```text
//! Uninitialized --initialize--> Active --destroy--> Destroyed
//! ```
//!
//! Everything the tuner learns lives in an [`ActiveTuner`] built by
//! `initialize` and dropped by `destroy`, so each tuner instance (and each
//! test) owns a fresh store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::config::TunerConfig;
use crate::error::{Result, TunerError};
use crate::mab::{
    Action, Bucket, CallId, CollType, DecisionMode, DecisionRecordStore, EpsilonGreedy,
    RewardTranslator, SelectionPolicy, Topology,
};
use crate::metrics::TunerMetrics;
use crate::pending::{DecisionContext, PendingTable};
use crate::telemetry::{RewardRecord, TelemetrySink};

/// Shape of one collective call, as seen by the tuner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallDescriptor {
    pub coll: CollType,
    pub message_bytes: u64,
    pub topology: Topology,
}

impl CallDescriptor {
    pub fn new(coll: CollType, message_bytes: u64) -> Self {
        Self {
            coll,
            message_bytes,
            topology: Topology::default(),
        }
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn bucket(&self) -> Bucket {
        Bucket::new(self.coll, self.message_bytes, self.topology)
    }
}

/// What `decide` returns to the adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub call_id: CallId,
    pub bucket: Bucket,
    pub action: Action,
    pub mode: DecisionMode,
}

/// How a report was handled. None of these are errors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReportOutcome {
    /// The reward was folded into the store.
    Recorded(RewardRecord),
    /// The decision was consumed but the latency sample was unusable.
    Rejected,
    /// No pending decision for this call id (duplicate, unknown or expired).
    Unmatched,
    /// The decision's bucket is beyond the store's capacity.
    Untracked,
}

/// Entry points the host adapter drives.
pub trait TunerPlugin: Send + Sync {
    /// Validate `config`, open resources, and become active.
    fn initialize(&self, config: TunerConfig) -> Result<()>;

    /// Pick one of `legal` for the call and remember it under `call_id`.
    fn decide(&self, call_id: CallId, call: &CallDescriptor, legal: &[Action]) -> Result<Decision>;

    /// Feed back the observed latency for an earlier decision.
    ///
    /// `None` or a non-positive latency consumes the decision without
    /// learning from it.
    fn report(&self, call_id: CallId, latency_us: Option<f64>) -> Result<ReportOutcome>;

    /// Flush telemetry and become inert.
    fn destroy(&self);
}

enum TunerState {
    Uninitialized,
    Active(Arc<ActiveTuner>),
    Destroyed,
}

impl TunerState {
    fn name(&self) -> &'static str {
        match self {
            TunerState::Uninitialized => "uninitialized",
            TunerState::Active(_) => "active",
            TunerState::Destroyed => "destroyed",
        }
    }
}

/// State owned by an active tuner.
pub struct ActiveTuner {
    store: DecisionRecordStore,
    policy: EpsilonGreedy,
    pending: PendingTable,
    telemetry: TelemetrySink,
    metrics: TunerMetrics,
    /// Next log sequence; held across the enqueue so lines land in order.
    sequence: Mutex<u64>,
    config: TunerConfig,
}

impl ActiveTuner {
    fn new(config: TunerConfig, metrics: TunerMetrics) -> Result<Self> {
        config.validate()?;
        let telemetry = match &config.reward_log {
            Some(path) => TelemetrySink::open(path, config.telemetry_queue, metrics.clone())?,
            None => TelemetrySink::disabled(metrics.clone()),
        };
        Ok(Self {
            store: DecisionRecordStore::new(config.max_buckets),
            policy: EpsilonGreedy::new(config.knobs.clone()),
            pending: PendingTable::new(
                config.pending_capacity,
                config.pending_ttl_ms.map(Duration::from_millis),
            ),
            telemetry,
            metrics,
            sequence: Mutex::new(0),
            config,
        })
    }

    pub fn store(&self) -> &DecisionRecordStore {
        &self.store
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    fn decide(&self, call_id: CallId, call: &CallDescriptor, legal: &[Action]) -> Result<Decision> {
        let bucket = call.bucket();
        // Reject a reused id before select() can admit the bucket.
        if self.pending.contains(call_id) {
            return Err(TunerError::DuplicateCallId(call_id));
        }
        let (action, mode) = self.policy.select(&self.store, bucket, legal)?;

        let context = DecisionContext {
            bucket,
            action,
            dispatched_at: Instant::now(),
        };
        let evicted = self.pending.insert(call_id, context)?;
        if evicted > 0 {
            self.metrics.pending_evicted.inc_by(evicted as u64);
            debug!(evicted, "discarded unreported decisions");
        }

        self.metrics.record_decision(mode);
        self.metrics.pending_contexts.set(self.pending.len() as i64);
        self.metrics
            .tracked_buckets
            .set(self.store.bucket_count() as i64);
        trace!(call_id = call_id.0, %bucket, %action, ?mode, "decided");

        Ok(Decision {
            call_id,
            bucket,
            action,
            mode,
        })
    }

    fn report(&self, call_id: CallId, latency_us: Option<f64>) -> ReportOutcome {
        let Some(context) = self.pending.take(call_id) else {
            self.metrics.reports_unmatched.inc();
            warn!(call_id = call_id.0, "report without a pending decision, ignoring");
            return ReportOutcome::Unmatched;
        };
        self.metrics.pending_contexts.set(self.pending.len() as i64);

        let Some(reward) = self.config.knobs.reward.to_reward(latency_us) else {
            self.metrics.rewards_rejected.inc();
            warn!(
                call_id = call_id.0,
                bucket = %context.bucket,
                ?latency_us,
                "dropping unusable latency sample"
            );
            return ReportOutcome::Rejected;
        };
        // to_reward only accepts finite positive latencies.
        let latency_us = latency_us.unwrap_or_default();

        if !self
            .policy
            .update(&self.store, context.bucket, context.action, reward)
        {
            debug!(call_id = call_id.0, bucket = %context.bucket, "bucket untracked, not learning");
            return ReportOutcome::Untracked;
        }
        self.metrics.rewards_recorded.inc();

        let record = {
            let mut next = self.sequence.lock();
            let record = RewardRecord {
                bucket: context.bucket,
                action: context.action,
                latency_us,
                reward,
                sequence: *next,
            };
            *next += 1;
            self.telemetry.append(record);
            record
        };
        trace!(call_id = call_id.0, bucket = %record.bucket, action = %record.action, reward, "recorded");
        ReportOutcome::Recorded(record)
    }

    fn report_elapsed(&self, call_id: CallId) -> ReportOutcome {
        let elapsed = self
            .pending
            .peek_dispatched_at(call_id)
            .map(|at| at.elapsed().as_secs_f64() * 1e6);
        self.report(call_id, elapsed)
    }

    fn shutdown(&self) {
        self.pending.clear();
        self.metrics.pending_contexts.set(0);
        self.telemetry.close();
    }
}

/// Epsilon-greedy tuner behind the host lifecycle.
///
/// # Example
///
/// ```
/// use nccl_bandit_tuner::{
///     mab::{Action, CallId, CollType, Protocol},
///     BanditTuner, CallDescriptor, ReportOutcome, TunerConfig, TunerPlugin,
/// };
///
/// let tuner = BanditTuner::new();
/// tuner.initialize(TunerConfig::default()).unwrap();
///
/// let call = CallDescriptor::new(CollType::AllReduce, 1 << 20);
/// let legal = [Action::AUTO, Action::protocol(Protocol::Ll128)];
/// let decision = tuner.decide(CallId(1), &call, &legal).unwrap();
/// assert!(legal.contains(&decision.action));
///
/// let outcome = tuner.report(CallId(1), Some(850.0)).unwrap();
/// assert!(matches!(outcome, ReportOutcome::Recorded(_)));
/// tuner.destroy();
/// ```
pub struct BanditTuner {
    state: RwLock<TunerState>,
    metrics: TunerMetrics,
}

impl Default for BanditTuner {
    fn default() -> Self {
        Self::new()
    }
}

impl BanditTuner {
    pub fn new() -> Self {
        Self::with_metrics(TunerMetrics::new())
    }

    pub fn with_metrics(metrics: TunerMetrics) -> Self {
        Self {
            state: RwLock::new(TunerState::Uninitialized),
            metrics,
        }
    }

    pub fn metrics(&self) -> &TunerMetrics {
        &self.metrics
    }

    /// Current lifecycle state name.
    pub fn state(&self) -> &'static str {
        self.state.read().name()
    }

    /// The active state, for inspection. None unless active.
    pub fn active(&self) -> Option<Arc<ActiveTuner>> {
        match &*self.state.read() {
            TunerState::Active(active) => Some(active.clone()),
            _ => None,
        }
    }

    /// Report using the wall-clock time since the decision was dispatched.
    pub fn report_elapsed(&self, call_id: CallId) -> Result<ReportOutcome> {
        Ok(self.require_active()?.report_elapsed(call_id))
    }

    fn require_active(&self) -> Result<Arc<ActiveTuner>> {
        match &*self.state.read() {
            TunerState::Active(active) => Ok(active.clone()),
            other => Err(TunerError::NotActive(other.name())),
        }
    }
}

impl TunerPlugin for BanditTuner {
    fn initialize(&self, config: TunerConfig) -> Result<()> {
        let mut state = self.state.write();
        if !matches!(*state, TunerState::Uninitialized) {
            return Err(TunerError::AlreadyInitialized(state.name()));
        }

        if let Some(registry) = &config.prometheus_registry {
            if let Err(e) = self.metrics.register(registry) {
                warn!(%e, "failed to register tuner metrics");
            }
        }

        // Nothing is published until every resource is open.
        let active = ActiveTuner::new(config, self.metrics.clone())?;
        info!(
            exploration_rate = active.config.knobs.exploration_rate,
            reward = ?active.config.knobs.reward,
            reward_log = ?active.telemetry.path(),
            candidates = active.config.candidate_actions.len(),
            max_buckets = active.config.max_buckets,
            "bandit tuner initialized"
        );
        *state = TunerState::Active(Arc::new(active));
        Ok(())
    }

    fn decide(&self, call_id: CallId, call: &CallDescriptor, legal: &[Action]) -> Result<Decision> {
        self.require_active()?.decide(call_id, call, legal)
    }

    fn report(&self, call_id: CallId, latency_us: Option<f64>) -> Result<ReportOutcome> {
        Ok(self.require_active()?.report(call_id, latency_us))
    }

    fn destroy(&self) {
        let previous = std::mem::replace(&mut *self.state.write(), TunerState::Destroyed);
        if let TunerState::Active(active) = previous {
            active.shutdown();
            info!(
                decisions = self.metrics.total_decisions(),
                rewards = self.metrics.rewards_recorded.get(),
                buckets = active.store.bucket_count(),
                "bandit tuner destroyed"
            );
        }
    }
}

impl Drop for BanditTuner {
    fn drop(&mut self) {
        if let TunerState::Active(active) = self.state.get_mut() {
            active.shutdown();
        }
    }
}

impl std::fmt::Debug for BanditTuner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BanditTuner")
            .field("state", &self.state())
            .field("metrics", &self.metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mab::{Algorithm, BanditKnobs, Protocol};

    fn config(rate: f64) -> TunerConfig {
        TunerConfig {
            knobs: BanditKnobs::default()
                .with_exploration_rate(rate)
                .with_seed(7),
            ..TunerConfig::default()
        }
    }

    fn active_tuner(rate: f64) -> BanditTuner {
        let tuner = BanditTuner::new();
        tuner.initialize(config(rate)).unwrap();
        tuner
    }

    fn call() -> CallDescriptor {
        CallDescriptor::new(CollType::AllReduce, 1 << 20)
    }

    const LEGAL: [Action; 3] = [
        Action::AUTO,
        Action::protocol(Protocol::Ll128),
        Action::protocol(Protocol::Simple),
    ];

    #[test]
    fn test_lifecycle_transitions() {
        let tuner = BanditTuner::new();
        assert_eq!(tuner.state(), "uninitialized");
        let err = tuner.decide(CallId(1), &call(), &LEGAL).unwrap_err();
        assert!(matches!(err, TunerError::NotActive("uninitialized")));

        tuner.initialize(config(0.1)).unwrap();
        assert_eq!(tuner.state(), "active");
        let err = tuner.initialize(config(0.1)).unwrap_err();
        assert!(matches!(err, TunerError::AlreadyInitialized("active")));

        tuner.destroy();
        assert_eq!(tuner.state(), "destroyed");
        let err = tuner.initialize(config(0.1)).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_invalid_config_leaves_tuner_uninitialized() {
        let tuner = BanditTuner::new();
        let err = tuner.initialize(config(1.5)).unwrap_err();
        assert!(matches!(err, TunerError::InvalidConfig { .. }));
        assert_eq!(tuner.state(), "uninitialized");
        assert!(tuner.initialize(config(0.1)).is_ok());
    }

    #[test]
    fn test_unopenable_reward_log_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let tuner = BanditTuner::new();
        let err = tuner
            .initialize(TunerConfig {
                reward_log: Some(dir.path().join("no/such/dir/rewards.log")),
                ..config(0.1)
            })
            .unwrap_err();
        assert!(matches!(err, TunerError::TelemetryOpen { .. }));
        assert_eq!(tuner.state(), "uninitialized");
    }

    #[test]
    fn test_report_updates_store() {
        let tuner = active_tuner(0.0);
        let decision = tuner.decide(CallId(1), &call(), &LEGAL).unwrap();
        let outcome = tuner.report(CallId(1), Some(10_000.0)).unwrap();
        let ReportOutcome::Recorded(record) = outcome else {
            panic!("expected a recorded reward, got {:?}", outcome);
        };
        assert_eq!(record.action, decision.action);
        assert_eq!(record.sequence, 0);
        assert!((record.reward - 0.1).abs() < 1e-12);

        let active = tuner.active().unwrap();
        let arm = active.store().get(decision.bucket, decision.action);
        assert_eq!(arm.pulls, 1);
    }

    #[test]
    fn test_duplicate_report_is_noop() {
        let tuner = active_tuner(0.0);
        let decision = tuner.decide(CallId(9), &call(), &LEGAL).unwrap();
        assert!(matches!(
            tuner.report(CallId(9), Some(500.0)).unwrap(),
            ReportOutcome::Recorded(_)
        ));
        assert_eq!(
            tuner.report(CallId(9), Some(500.0)).unwrap(),
            ReportOutcome::Unmatched
        );
        let arm = tuner
            .active()
            .unwrap()
            .store()
            .get(decision.bucket, decision.action);
        assert_eq!(arm.pulls, 1);
        assert_eq!(tuner.metrics().reports_unmatched.get(), 1);
    }

    #[test]
    fn test_degenerate_latency_consumes_without_learning() {
        let tuner = active_tuner(0.0);
        let decision = tuner.decide(CallId(1), &call(), &LEGAL).unwrap();
        assert_eq!(
            tuner.report(CallId(1), Some(0.0)).unwrap(),
            ReportOutcome::Rejected
        );
        assert_eq!(
            tuner.report(CallId(1), Some(100.0)).unwrap(),
            ReportOutcome::Unmatched
        );
        let arm = tuner
            .active()
            .unwrap()
            .store()
            .get(decision.bucket, decision.action);
        assert_eq!(arm.pulls, 0);
    }

    #[test]
    fn test_in_flight_call_id_reuse_rejected() {
        let tuner = active_tuner(0.1);
        tuner.decide(CallId(3), &call(), &LEGAL).unwrap();
        let err = tuner.decide(CallId(3), &call(), &LEGAL).unwrap_err();
        assert!(matches!(err, TunerError::DuplicateCallId(CallId(3))));
    }

    #[test]
    fn test_rejected_call_id_does_not_admit_bucket() {
        let tuner = BanditTuner::new();
        tuner
            .initialize(TunerConfig {
                max_buckets: 2,
                ..config(0.0)
            })
            .unwrap();
        tuner.decide(CallId(1), &call(), &LEGAL).unwrap();
        let other = CallDescriptor::new(CollType::Broadcast, 64);
        let err = tuner.decide(CallId(1), &other, &LEGAL).unwrap_err();
        assert!(matches!(err, TunerError::DuplicateCallId(CallId(1))));
        assert_eq!(tuner.active().unwrap().store().bucket_count(), 1);

        // The slot is still free for a well-formed call.
        let third = CallDescriptor::new(CollType::AllGather, 64);
        let decision = tuner.decide(CallId(2), &third, &LEGAL).unwrap();
        assert_ne!(decision.mode, DecisionMode::Untracked);
    }

    #[test]
    fn test_empty_legal_set_is_contract_violation() {
        let tuner = active_tuner(0.1);
        let err = tuner.decide(CallId(1), &call(), &[]).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_calls_after_destroy_fail() {
        let tuner = active_tuner(0.1);
        tuner.decide(CallId(1), &call(), &LEGAL).unwrap();
        tuner.destroy();
        assert!(matches!(
            tuner.decide(CallId(2), &call(), &LEGAL),
            Err(TunerError::NotActive("destroyed"))
        ));
        assert!(tuner.report(CallId(1), Some(1.0)).is_err());
        // Destroy is idempotent.
        tuner.destroy();
    }

    #[test]
    fn test_report_elapsed_measures_dispatch() {
        let tuner = active_tuner(0.0);
        tuner.decide(CallId(1), &call(), &LEGAL).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let ReportOutcome::Recorded(record) = tuner.report_elapsed(CallId(1)).unwrap() else {
            panic!("expected a recorded reward");
        };
        assert!(record.latency_us >= 2_000.0);
        assert_eq!(tuner.report_elapsed(CallId(1)).unwrap(), ReportOutcome::Unmatched);
    }

    #[test]
    fn test_topology_separates_buckets() {
        let tuner = active_tuner(0.0);
        let legal = [Action::AUTO, Action::pair(Algorithm::Ring, Protocol::Simple)];
        let a = tuner
            .decide(CallId(1), &call().with_topology(Topology::new(1, 8)), &legal)
            .unwrap();
        let b = tuner
            .decide(CallId(2), &call().with_topology(Topology::new(2, 16)), &legal)
            .unwrap();
        assert_ne!(a.bucket, b.bucket);
        assert_eq!(tuner.active().unwrap().store().bucket_count(), 2);
    }

    #[test]
    fn test_buckets_beyond_capacity_never_learn() {
        let tuner = BanditTuner::new();
        tuner
            .initialize(TunerConfig {
                max_buckets: 1,
                ..config(0.0)
            })
            .unwrap();
        tuner.decide(CallId(1), &call(), &LEGAL).unwrap();
        let other = CallDescriptor::new(CollType::Broadcast, 64);
        let decision = tuner.decide(CallId(2), &other, &LEGAL).unwrap();
        assert_eq!(decision.mode, DecisionMode::Untracked);
        assert_eq!(decision.action, Action::AUTO);
        assert_eq!(
            tuner.report(CallId(2), Some(10.0)).unwrap(),
            ReportOutcome::Untracked
        );
        assert_eq!(tuner.active().unwrap().store().bucket_count(), 1);
    }

    #[test]
    fn test_concurrent_decide_and_report() {
        let tuner = Arc::new(active_tuner(0.2));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let tuner = tuner.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let id = CallId(t << 32 | i);
                        let d = tuner.decide(id, &call(), &LEGAL).unwrap();
                        assert!(LEGAL.contains(&d.action));
                        tuner.report(id, Some(100.0 + i as f64)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let active = tuner.active().unwrap();
        let pulls: u64 = LEGAL
            .iter()
            .map(|a| active.store().get(call().bucket(), *a).pulls)
            .sum();
        assert_eq!(pulls, 2000);
        assert_eq!(tuner.metrics().rewards_recorded.get(), 2000);
    }

    #[test]
    fn test_concurrent_reports_log_in_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rewards.log");
        let tuner = BanditTuner::new();
        tuner
            .initialize(TunerConfig {
                reward_log: Some(path.clone()),
                telemetry_queue: 4096,
                ..config(0.3)
            })
            .unwrap();
        let tuner = Arc::new(tuner);
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let tuner = tuner.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let id = CallId(t << 32 | i);
                        tuner.decide(id, &call(), &LEGAL).unwrap();
                        tuner.report(id, Some(50.0 + i as f64)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        tuner.destroy();

        let records = crate::telemetry::read_log(&path).unwrap();
        assert_eq!(records.len(), 800);
        for (expected, record) in records.iter().enumerate() {
            assert_eq!(record.sequence, expected as u64);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reward_log_write_errors_do_not_fail_reports() {
        let full = std::path::Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let tuner = BanditTuner::new();
        tuner
            .initialize(TunerConfig {
                reward_log: Some(full.to_path_buf()),
                ..config(0.0)
            })
            .unwrap();
        for i in 0..5 {
            tuner.decide(CallId(i), &call(), &LEGAL).unwrap();
            assert!(matches!(
                tuner.report(CallId(i), Some(100.0)).unwrap(),
                ReportOutcome::Recorded(_)
            ));
        }
        // Destroy joins the writer, so every failed append is counted.
        tuner.destroy();
        assert_eq!(tuner.metrics().telemetry_write_errors.get(), 5);
        assert_eq!(tuner.metrics().rewards_recorded.get(), 5);
    }
}
