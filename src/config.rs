//! Configuration types for the tuner.

use std::path::PathBuf;

use prometheus::Registry;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, TunerError};
use crate::mab::{Action, Algorithm, BanditKnobs, Protocol};

/// Debug verbosity of the tuner's own diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// No diagnostics at all
    Silent,
    /// Lifecycle events and warnings
    #[default]
    Info,
    /// Every decision and reward
    Verbose,
}

/// Configuration for the tuner.
///
/// This struct can be deserialized from TOML, YAML, JSON, or environment variables
/// using figment. See [`TunerBuilder`](crate::TunerBuilder) for the merge order.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunerConfig {
    /// Bandit policy knobs.
    #[serde(default)]
    pub knobs: BanditKnobs,

    /// Telemetry destination. None disables the reward log.
    #[serde(default)]
    pub reward_log: Option<PathBuf>,

    /// File the workload appends observed latencies to.
    /// Only consumed by the host ABI adapter.
    #[serde(default)]
    pub feedback_file: Option<PathBuf>,

    /// Diagnostic verbosity (default: info)
    #[serde(default)]
    pub verbosity: Verbosity,

    /// Actions offered to the bandit when the host is feasible for them.
    /// Accepts a list or a comma separated string.
    #[serde(
        default = "default_candidate_actions",
        deserialize_with = "deserialize_actions"
    )]
    pub candidate_actions: Vec<Action>,

    /// Maximum number of buckets that learn (default: 64)
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,

    /// Maximum number of decisions awaiting a report (default: 4096)
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,

    /// Age after which an unreported decision is discarded. None keeps
    /// decisions until capacity forces eviction.
    #[serde(default)]
    pub pending_ttl_ms: Option<u64>,

    /// Bounded queue length between reporters and the log writer (default: 1024)
    #[serde(default = "default_telemetry_queue")]
    pub telemetry_queue: usize,

    /// Channel count the host adapter requests alongside a steered choice.
    /// None leaves the host's channel count untouched.
    #[serde(default)]
    pub channels: Option<i32>,

    /// Prometheus registry for metrics exposition.
    /// Not serializable - must be set programmatically.
    #[serde(skip)]
    pub prometheus_registry: Option<Registry>,
}

fn default_candidate_actions() -> Vec<Action> {
    vec![
        Action::AUTO,
        Action::pair(Algorithm::Tree, Protocol::Simple),
        Action::pair(Algorithm::Tree, Protocol::Ll128),
        Action::pair(Algorithm::Ring, Protocol::Simple),
    ]
}

fn default_max_buckets() -> usize {
    64
}

fn default_pending_capacity() -> usize {
    4096
}

fn default_telemetry_queue() -> usize {
    1024
}

fn deserialize_actions<'de, D>(deserializer: D) -> std::result::Result<Vec<Action>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ActionList {
        List(Vec<Action>),
        Csv(String),
    }

    match ActionList::deserialize(deserializer)? {
        ActionList::List(actions) => Ok(actions),
        ActionList::Csv(s) => s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|part| part.parse().map_err(serde::de::Error::custom))
            .collect(),
    }
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            knobs: BanditKnobs::default(),
            reward_log: None,
            feedback_file: None,
            verbosity: Verbosity::default(),
            candidate_actions: default_candidate_actions(),
            max_buckets: default_max_buckets(),
            pending_capacity: default_pending_capacity(),
            pending_ttl_ms: None,
            telemetry_queue: default_telemetry_queue(),
            channels: None,
            prometheus_registry: None,
        }
    }
}

impl TunerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every recognized option for a legal value.
    pub fn validate(&self) -> Result<()> {
        self.knobs.validate()?;
        if self.candidate_actions.is_empty() {
            return Err(TunerError::InvalidConfig {
                key: "candidate_actions",
                reason: "at least one action is required".to_string(),
            });
        }
        for (key, value) in [
            ("max_buckets", self.max_buckets),
            ("pending_capacity", self.pending_capacity),
            ("telemetry_queue", self.telemetry_queue),
        ] {
            if value == 0 {
                return Err(TunerError::InvalidConfig {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if let Some(channels) = self.channels {
            if channels <= 0 {
                return Err(TunerError::InvalidConfig {
                    key: "channels",
                    reason: format!("{} is not a positive channel count", channels),
                });
            }
        }
        Ok(())
    }
}
