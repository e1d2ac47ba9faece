//! # nccl-bandit-tuner
//!
//! **Learning which collective algorithm and protocol to use, one call at a time**
//!
//! An online tuner for a collective communication runtime. For every
//! collective call the host asks which (algorithm, protocol) combination to
//! use; the tuner answers with an epsilon-greedy bandit keyed by call shape
//! and improves from the latencies fed back to it.
//!
//! ## Features
//!
//! - **Host plugin**: builds as a `cdylib` exporting `ncclTunerPlugin_v5`
//! - **Epsilon-greedy bandit**: per-bucket arms, deterministic tie-breaking, seedable
//! - **Bounded state**: capped bucket count, bounded pending-call table with optional TTL
//! - **Reward log**: one line per observation, written off the decision path
//! - **Flexible Configuration**: Configure via files (TOML/YAML/JSON), environment variables, or code
//! - **Prometheus metrics**: always-on counters, optional registry exposition
//!
//! ## Quick Start
//!
//! ```
//! use nccl_bandit_tuner::mab::{Action, CallId, CollType, Protocol};
//! use nccl_bandit_tuner::{CallDescriptor, TunerBuilder, TunerPlugin};
//!
//! let tuner = TunerBuilder::new().exploration_rate(0.1).seed(7).build()?;
//!
//! let legal = [Action::AUTO, Action::protocol(Protocol::Ll128), Action::protocol(Protocol::Simple)];
//! let call = CallDescriptor::new(CollType::AllReduce, 1 << 20);
//!
//! let decision = tuner.decide(CallId(1), &call, &legal)?;
//! // ... run the collective with decision.action ...
//! tuner.report(CallId(1), Some(412.0))?;
//!
//! tuner.destroy();
//! # Ok::<(), nccl_bandit_tuner::TunerError>(())
//! ```
//!
//! ## Configuration
//!
//! Configuration sources are merged in order (later sources override earlier):
//! 1. Default values
//! 2. Config files (via `.file()`)
//! 3. Environment variables (via `.env()`)
//! 4. Programmatic overrides
//!
//! ### Config File Example (TOML)
//!
//! ```toml
//! reward_log = "/var/log/nccl_tuner_rewards.log"
//! candidate_actions = ["auto", "tree/simple", "tree/ll128", "ring/simple"]
//! max_buckets = 64
//!
//! [knobs]
//! exploration_rate = 0.1
//! reward = "inverse"
//! ```
//!
//! ### Environment Variables
//!
//! With the `NCCL_TUNER_` prefix:
//! - `NCCL_TUNER_EPS=0.05`
//! - `NCCL_TUNER_SEED=42`
//! - `NCCL_TUNER_REWARD_LOG=/tmp/rewards.log`
//! - `NCCL_TUNER_REWARD_FILE=/tmp/feedback.log`
//! - `NCCL_TUNER_ACTIONS=auto,ll128,simple`
//! - `NCCL_TUNER_VERBOSITY=verbose`
//!
//! ## Loading into the host
//!
//! Point the host at the built library (for NCCL,
//! `NCCL_TUNER_PLUGIN=libnccl_bandit_tuner.so`). The host never reports
//! completion itself, so the workload appends measured latencies to the
//! feedback file; see [`feedback`].

pub mod builder;
pub mod config;
pub mod error;
pub mod feedback;
pub mod ffi;
pub mod logging;
pub mod mab;
pub mod metrics;
pub mod nccl;
pub(crate) mod pending;
pub mod plugin;
pub mod telemetry;

pub use builder::TunerBuilder;
pub use config::{TunerConfig, Verbosity};
pub use error::{Result, TunerError};
pub use mab::{BanditKnobs, EpsilonGreedy, SelectionPolicy};
pub use metrics::TunerMetrics;
pub use plugin::{BanditTuner, CallDescriptor, Decision, ReportOutcome, TunerPlugin};
pub use telemetry::{RewardRecord, TelemetrySink};
