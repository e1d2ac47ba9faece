//! The exported tuner plugin symbol.
//!
//! The host `dlopen`s the library and reads `ncclTunerPlugin_v5`. Each
//! communicator gets its own [`CommTuner`] behind the opaque context
//! pointer, so learning is per communicator and per process.
//!
//! The host only asks for decisions; it never reports completion. Latencies
//! arrive through the feedback file (see [`crate::feedback`]) and are
//! matched to the most recent decision for their bucket.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::builder::TunerBuilder;
use crate::config::TunerConfig;
use crate::error::Result;
use crate::feedback::RewardFeed;
use crate::logging::{self, HostLogFn};
use crate::mab::{Action, Bucket, CallId, CollType, Topology};
use crate::nccl::{CostTable, NcclResult};
use crate::plugin::{BanditTuner, CallDescriptor, ReportOutcome, TunerPlugin};

/// Name the host prints when loading the plugin.
pub const PLUGIN_NAME: &CStr = c"BanditTuner";

type InitFn = unsafe extern "C" fn(
    context: *mut *mut c_void,
    comm_id: u64,
    n_ranks: usize,
    n_nodes: usize,
    log_fn: Option<HostLogFn>,
    nvl_domain_info: *mut c_void,
    constants: *mut c_void,
) -> c_int;

type GetCollInfoFn = unsafe extern "C" fn(
    context: *mut c_void,
    coll_type: c_int,
    n_bytes: usize,
    num_pipe_ops: c_int,
    coll_cost_table: *mut *mut f32,
    num_algo: c_int,
    num_proto: c_int,
    reg_buff: c_int,
    n_channels: *mut c_int,
) -> c_int;

type FinalizeFn = unsafe extern "C" fn(context: *mut c_void) -> c_int;

/// Host plugin table, version 5.
#[repr(C)]
pub struct NcclTunerV5 {
    pub name: *const c_char,
    pub init: InitFn,
    pub get_coll_info: GetCollInfoFn,
    pub finalize: FinalizeFn,
}

// SAFETY: the table is immutable and `name` points at a 'static string.
unsafe impl Sync for NcclTunerV5 {}

#[allow(non_upper_case_globals)]
#[no_mangle]
pub static ncclTunerPlugin_v5: NcclTunerV5 = NcclTunerV5 {
    name: PLUGIN_NAME.as_ptr(),
    init: plugin_init,
    get_coll_info: plugin_get_coll_info,
    finalize: plugin_finalize,
};

/// Per-communicator state behind the host's context pointer.
pub struct CommTuner {
    tuner: BanditTuner,
    topology: Topology,
    candidates: Vec<Action>,
    channels: Option<i32>,
    feed: Option<Mutex<RewardFeed>>,
    last_call: Mutex<HashMap<Bucket, CallId>>,
    next_call: AtomicU64,
}

impl CommTuner {
    /// Build and activate a tuner for one communicator.
    pub fn new(comm_id: u64, topology: Topology, mut config: TunerConfig) -> Result<Self> {
        config.reward_log = match config.reward_log.take() {
            Some(path) if path.as_os_str().is_empty() => None,
            Some(path) => Some(path),
            None => Some(default_reward_log(comm_id)),
        };
        if config.knobs.seed.is_none() {
            config.knobs.seed = Some(wall_clock_seed() ^ comm_id);
        }
        if config.feedback_file.is_some() && config.feedback_file == config.reward_log {
            warn!(
                path = ?config.feedback_file,
                "feedback file is the reward log, ignoring feedback"
            );
            config.feedback_file = None;
        }

        let candidates = config.candidate_actions.clone();
        let channels = config.channels;
        let feed = config
            .feedback_file
            .clone()
            .map(|path| Mutex::new(RewardFeed::new(path)));

        let tuner = BanditTuner::new();
        tuner.initialize(config)?;
        info!(
            comm_id,
            nodes = topology.nodes,
            ranks = topology.ranks,
            feedback = ?feed.as_ref().map(|f| f.lock().path().to_path_buf()),
            "communicator tuner ready"
        );

        Ok(Self {
            tuner,
            topology,
            candidates,
            channels,
            feed,
            last_call: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(0),
        })
    }

    pub fn tuner(&self) -> &BanditTuner {
        &self.tuner
    }

    /// Report every new feedback line against its bucket's latest decision.
    pub fn ingest_feedback(&self) {
        let Some(feed) = &self.feed else {
            return;
        };
        let batch = feed.lock().poll();
        let metrics = self.tuner.metrics();
        metrics.feedback_malformed.inc_by(batch.malformed as u64);

        for sample in batch.samples {
            let call_id = self.last_call.lock().remove(&sample.bucket);
            let Some(call_id) = call_id else {
                metrics.reports_unmatched.inc();
                debug!(bucket = %sample.bucket, "feedback without a decision, ignoring");
                continue;
            };
            match self.tuner.report(call_id, Some(sample.latency_us)) {
                Ok(ReportOutcome::Recorded(record)) => {
                    debug!(bucket = %record.bucket, action = %record.action, latency_us = record.latency_us, "feedback recorded");
                }
                Ok(_) => {}
                Err(e) => warn!(%e, "feedback report failed"),
            }
        }
    }

    /// Decide for one host call and steer the cost table.
    pub fn decide(
        &self,
        coll: CollType,
        n_bytes: u64,
        table: &mut CostTable<'_>,
        n_channels: Option<&mut c_int>,
    ) -> Result<()> {
        self.ingest_feedback();

        let legal = table.legal_actions(&self.candidates);
        let call_id = CallId(self.next_call.fetch_add(1, Ordering::Relaxed));
        let call = CallDescriptor::new(coll, n_bytes).with_topology(self.topology);
        let decision = self.tuner.decide(call_id, &call, &legal)?;

        if table.steer(decision.action).is_some() {
            if let (Some(channels), Some(out)) = (self.channels, n_channels) {
                *out = channels;
            }
        }
        self.last_call.lock().insert(decision.bucket, call_id);
        Ok(())
    }
}

impl Drop for CommTuner {
    fn drop(&mut self) {
        self.tuner.destroy();
    }
}

fn default_reward_log(comm_id: u64) -> PathBuf {
    PathBuf::from(format!("/tmp/nccl_tuner_rewards_{}.log", comm_id))
}

fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn guarded(what: &'static str, f: impl FnOnce() -> NcclResult) -> c_int {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.code(),
        Err(_) => {
            error!(what, "panic in tuner plugin");
            NcclResult::InternalError.code()
        }
    }
}

unsafe extern "C" fn plugin_init(
    context: *mut *mut c_void,
    comm_id: u64,
    n_ranks: usize,
    n_nodes: usize,
    log_fn: Option<HostLogFn>,
    _nvl_domain_info: *mut c_void,
    _constants: *mut c_void,
) -> c_int {
    guarded("init", || {
        if context.is_null() {
            return NcclResult::InvalidArgument;
        }
        let config = TunerBuilder::new().env().build_config();
        let verbosity = config.as_ref().map(|c| c.verbosity).unwrap_or_default();
        logging::init(verbosity, log_fn);

        let topology = Topology::new(
            u32::try_from(n_nodes).unwrap_or(u32::MAX),
            u32::try_from(n_ranks).unwrap_or(u32::MAX),
        );
        match config.and_then(|config| CommTuner::new(comm_id, topology, config)) {
            Ok(comm) => {
                // SAFETY: checked non-null above; the host owns the slot.
                unsafe { *context = Box::into_raw(Box::new(comm)).cast() };
                NcclResult::Success
            }
            Err(e) => {
                error!(%e, comm_id, "tuner initialization failed");
                NcclResult::from(&e)
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn plugin_get_coll_info(
    context: *mut c_void,
    coll_type: c_int,
    n_bytes: usize,
    _num_pipe_ops: c_int,
    coll_cost_table: *mut *mut f32,
    num_algo: c_int,
    num_proto: c_int,
    _reg_buff: c_int,
    n_channels: *mut c_int,
) -> c_int {
    guarded("getCollInfo", || {
        // SAFETY: the context was produced by plugin_init and stays live
        // until plugin_finalize.
        let Some(comm) = (unsafe { context.cast::<CommTuner>().as_ref() }) else {
            return NcclResult::InternalError;
        };
        let Some(coll) = CollType::from_raw(coll_type) else {
            debug!(coll_type, "unknown collective, leaving defaults");
            return NcclResult::Success;
        };
        // SAFETY: the host passes a num_algo x num_proto table valid for
        // the duration of this call.
        let Some(mut table) = (unsafe { CostTable::from_raw(coll_cost_table, num_algo, num_proto) })
        else {
            return NcclResult::InvalidArgument;
        };
        // SAFETY: null or a valid out-parameter for this call.
        let n_channels = unsafe { n_channels.as_mut() };

        match comm.decide(coll, n_bytes as u64, &mut table, n_channels) {
            Ok(()) => NcclResult::Success,
            Err(e) => {
                error!(%e, "tuner decision failed");
                NcclResult::from(&e)
            }
        }
    })
}

unsafe extern "C" fn plugin_finalize(context: *mut c_void) -> c_int {
    guarded("finalize", || {
        if !context.is_null() {
            // SAFETY: produced by Box::into_raw in plugin_init; the host
            // finalizes each context exactly once.
            drop(unsafe { Box::from_raw(context.cast::<CommTuner>()) });
        }
        NcclResult::Success
    })
}
