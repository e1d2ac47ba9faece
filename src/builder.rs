//! Builder pattern for constructing tuners.
//!
//! The builder supports multiple configuration sources using figment:
//! - Default values
//! - Config files (TOML, YAML, JSON)
//! - Environment variables
//! - Programmatic overrides

use crate::config::{TunerConfig, Verbosity};
use crate::error::Result;
use crate::mab::{Action, BanditKnobs, RewardTransform};
use crate::plugin::{BanditTuner, TunerPlugin};

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::value::{Uncased, UncasedStr};
use figment::Figment;
use prometheus::Registry;
use std::path::{Path, PathBuf};

/// Prefix of the environment variables the tuner recognizes.
pub const ENV_PREFIX: &str = "NCCL_TUNER_";

/// Builder for constructing a [`BanditTuner`].
///
/// Configuration sources are merged in the following order (later sources override earlier):
/// 1. Default values
/// 2. Config files (in order added)
/// 3. Environment variables
/// 4. Programmatic overrides
///
/// # Examples
///
/// ```ignore
/// use nccl_bandit_tuner::TunerBuilder;
///
/// let tuner = TunerBuilder::new()
///     .file("tuner.toml")
///     .env()
///     .exploration_rate(0.05)
///     .build()?;
/// ```
pub struct TunerBuilder {
    figment: Figment,
    prometheus_registry: Option<Registry>,
}

impl Default for TunerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TunerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunerBuilder")
            .field("figment", &self.figment)
            .field(
                "prometheus_registry",
                &self.prometheus_registry.as_ref().map(|_| "<Registry>"),
            )
            .finish()
    }
}

/// Map `NCCL_TUNER_*` suffixes onto config keys.
///
/// Short names like `EPS` and the legacy `REWARD_FILE` are aliases.
fn env_key(key: &UncasedStr) -> Uncased<'_> {
    let key = key.as_str().to_ascii_lowercase();
    let alias = match key.as_str() {
        "eps" | "exploration_rate" => Some("knobs.exploration_rate"),
        "seed" => Some("knobs.seed"),
        "sweep" => Some("knobs.sweep_unvisited"),
        "reward" => Some("knobs.reward"),
        "neutral_reward" => Some("knobs.neutral_reward"),
        "reward_file" => Some("feedback_file"),
        "actions" => Some("candidate_actions"),
        _ => None,
    };
    match alias {
        Some(alias) => Uncased::from(alias),
        None => Uncased::from(key),
    }
}

impl TunerBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            figment: Figment::from(Serialized::defaults(TunerConfig::default())),
            prometheus_registry: None,
        }
    }

    /// Add a configuration file.
    ///
    /// Supports TOML, YAML, and JSON formats (detected by extension).
    /// Files are merged in the order they are added.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        self.figment = match extension.to_lowercase().as_str() {
            "toml" => self.figment.merge(Toml::file(path)),
            "yaml" | "yml" => self.figment.merge(Yaml::file(path)),
            "json" => self.figment.merge(Json::file(path)),
            _ => {
                // Default to TOML
                self.figment.merge(Toml::file(path))
            }
        };
        self
    }

    /// Add the `NCCL_TUNER_*` environment variables.
    ///
    /// Recognized: `EPS`/`EXPLORATION_RATE`, `SEED`, `SWEEP`, `REWARD`,
    /// `NEUTRAL_REWARD`, `REWARD_LOG`, `FEEDBACK_FILE` (legacy `REWARD_FILE`),
    /// `VERBOSITY`, `ACTIONS`, `MAX_BUCKETS`, `PENDING_CAPACITY`,
    /// `PENDING_TTL_MS`, `TELEMETRY_QUEUE`, `CHANNELS`. Other variables under
    /// the prefix are ignored.
    pub fn env(self) -> Self {
        self.env_prefix(ENV_PREFIX)
    }

    /// Add environment variables under a custom prefix (including any trailing underscore).
    pub fn env_prefix(mut self, prefix: &str) -> Self {
        self.figment = self.figment.merge(Env::prefixed(prefix).map(env_key));
        self
    }

    /// Set the exploration rate.
    pub fn exploration_rate(mut self, rate: f64) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("knobs.exploration_rate", rate));
        self
    }

    /// Fix the RNG seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.figment = self.figment.merge(Serialized::default("knobs.seed", seed));
        self
    }

    /// Set the latency to reward transform.
    pub fn reward_transform(mut self, reward: RewardTransform) -> Self {
        self.figment = self.figment.merge(Serialized::default("knobs.reward", reward));
        self
    }

    /// Replace all bandit knobs.
    pub fn knobs(mut self, knobs: BanditKnobs) -> Self {
        self.figment = self.figment.merge(Serialized::default("knobs", knobs));
        self
    }

    /// Set the reward log destination.
    pub fn reward_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("reward_log", path.into()));
        self
    }

    /// Set the latency feedback file.
    pub fn feedback_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("feedback_file", path.into()));
        self
    }

    /// Set the diagnostic verbosity.
    pub fn verbosity(mut self, verbosity: Verbosity) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("verbosity", verbosity));
        self
    }

    /// Set the candidate action set.
    pub fn candidate_actions(mut self, actions: Vec<Action>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("candidate_actions", actions));
        self
    }

    /// Cap the number of learning buckets.
    pub fn max_buckets(mut self, n: usize) -> Self {
        self.figment = self.figment.merge(Serialized::default("max_buckets", n));
        self
    }

    /// Cap the number of decisions awaiting a report.
    pub fn pending_capacity(mut self, n: usize) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("pending_capacity", n));
        self
    }

    /// Discard decisions left unreported for longer than `ms`.
    pub fn pending_ttl_ms(mut self, ms: u64) -> Self {
        self.figment = self.figment.merge(Serialized::default("pending_ttl_ms", ms));
        self
    }

    /// Set the telemetry queue length.
    pub fn telemetry_queue(mut self, n: usize) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("telemetry_queue", n));
        self
    }

    /// Request this channel count whenever the host adapter steers a call.
    pub fn channels(mut self, n: i32) -> Self {
        self.figment = self.figment.merge(Serialized::default("channels", n));
        self
    }

    /// Set the Prometheus registry for metrics exposition.
    ///
    /// If set, tuner metrics will be registered with this registry.
    pub fn prometheus_registry(mut self, registry: Registry) -> Self {
        self.prometheus_registry = Some(registry);
        self
    }

    /// Extract and validate the merged configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if extraction fails or any option is out of range.
    pub fn build_config(self) -> Result<TunerConfig> {
        let mut config: TunerConfig = self.figment.extract().map_err(Box::new)?;
        config.prometheus_registry = self.prometheus_registry;
        config.validate()?;
        Ok(config)
    }

    /// Build an active tuner.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the reward log
    /// cannot be opened.
    pub fn build(self) -> Result<BanditTuner> {
        let config = self.build_config()?;
        let tuner = BanditTuner::new();
        tuner.initialize(config)?;
        Ok(tuner)
    }
}
