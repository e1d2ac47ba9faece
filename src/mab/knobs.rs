//! Configuration knobs for the bandit policy.
//!
//! All knobs have sensible defaults; most deployments only touch the
//! exploration rate.

use serde::{Deserialize, Serialize};

use super::reward::RewardTransform;
use crate::error::{Result, TunerError};

/// Configuration knobs for the epsilon-greedy policy.
///
/// # Selection
///
/// With probability `exploration_rate` a call picks uniformly among the
/// legal actions; otherwise it picks the legal action with the highest mean
/// reward, ties going to the lowest action index. Unvisited arms score
/// [`neutral_score`](Self::neutral_score), which sits below every reward the
/// configured transform can produce.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BanditKnobs {
    /// Probability of a uniform random pick.
    /// Default: 0.1
    #[serde(default = "default_exploration_rate")]
    pub exploration_rate: f64,

    /// Score given to arms with zero pulls.
    /// Default: None (the transform's floor, see [`RewardTransform::floor`])
    #[serde(default)]
    pub neutral_reward: Option<f64>,

    /// Visit every unvisited legal arm once before exploiting.
    /// Default: false
    #[serde(default)]
    pub sweep_unvisited: bool,

    /// RNG seed. None seeds from entropy.
    /// Default: None
    #[serde(default)]
    pub seed: Option<u64>,

    /// Latency to reward mapping.
    /// Default: inverse
    #[serde(default)]
    pub reward: RewardTransform,
}

fn default_exploration_rate() -> f64 {
    0.1
}

impl Default for BanditKnobs {
    fn default() -> Self {
        Self {
            exploration_rate: default_exploration_rate(),
            neutral_reward: None,
            sweep_unvisited: false,
            seed: None,
            reward: RewardTransform::default(),
        }
    }
}

impl BanditKnobs {
    /// Create knobs with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the exploration rate.
    pub fn with_exploration_rate(mut self, rate: f64) -> Self {
        self.exploration_rate = rate;
        self
    }

    /// Builder method to fix the RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builder method to enable the unvisited-arm sweep.
    pub fn with_sweep(mut self) -> Self {
        self.sweep_unvisited = true;
        self
    }

    /// Builder method to set the reward transform.
    pub fn with_reward(mut self, reward: RewardTransform) -> Self {
        self.reward = reward;
        self
    }

    /// Builder method to pin the score of unvisited arms.
    pub fn with_neutral_reward(mut self, neutral: f64) -> Self {
        self.neutral_reward = Some(neutral);
        self
    }

    /// Score of an arm with zero pulls.
    pub fn neutral_score(&self) -> f64 {
        self.neutral_reward.unwrap_or_else(|| self.reward.floor())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.exploration_rate) {
            return Err(TunerError::InvalidConfig {
                key: "knobs.exploration_rate",
                reason: format!("{} is outside [0, 1]", self.exploration_rate),
            });
        }
        if let Some(neutral) = self.neutral_reward {
            if !neutral.is_finite() {
                return Err(TunerError::InvalidConfig {
                    key: "knobs.neutral_reward",
                    reason: "must be finite".to_string(),
                });
            }
            if self.reward.ceiling().is_some_and(|ceiling| neutral >= ceiling) {
                return Err(TunerError::InvalidConfig {
                    key: "knobs.neutral_reward",
                    reason: format!(
                        "{} would rank unvisited arms above every {:?} reward",
                        neutral, self.reward
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let knobs = BanditKnobs::default();
        assert!((knobs.exploration_rate - 0.1).abs() < 1e-12);
        assert_eq!(knobs.neutral_reward, None);
        assert_eq!(knobs.neutral_score(), 0.0);
        assert!(!knobs.sweep_unvisited);
        assert!(knobs.seed.is_none());
        assert_eq!(knobs.reward, RewardTransform::Inverse);
    }

    #[test]
    fn test_builder_methods() {
        let knobs = BanditKnobs::default()
            .with_exploration_rate(0.0)
            .with_seed(7)
            .with_sweep()
            .with_reward(RewardTransform::Negative);

        assert_eq!(knobs.exploration_rate, 0.0);
        assert_eq!(knobs.seed, Some(7));
        assert!(knobs.sweep_unvisited);
        assert_eq!(knobs.reward, RewardTransform::Negative);
    }

    #[test]
    fn test_validate_rejects_out_of_range_rate() {
        assert!(BanditKnobs::default().validate().is_ok());
        assert!(BanditKnobs::default()
            .with_exploration_rate(1.5)
            .validate()
            .is_err());
        assert!(BanditKnobs::default()
            .with_exploration_rate(-0.1)
            .validate()
            .is_err());
        assert!(BanditKnobs::default()
            .with_exploration_rate(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_neutral_score_follows_transform() {
        let negative = BanditKnobs::default().with_reward(RewardTransform::Negative);
        assert!(negative.neutral_score().is_finite());
        assert!(negative.neutral_score() < -1e300);
        assert_eq!(negative.clone().with_neutral_reward(-5.0).neutral_score(), -5.0);
    }

    #[test]
    fn test_validate_rejects_neutral_above_negative_rewards() {
        let negative = BanditKnobs::default().with_reward(RewardTransform::Negative);
        assert!(negative.validate().is_ok());
        assert!(negative.clone().with_neutral_reward(-1e9).validate().is_ok());
        assert!(negative.clone().with_neutral_reward(0.0).validate().is_err());
        assert!(negative.with_neutral_reward(3.0).validate().is_err());
        assert!(BanditKnobs::default()
            .with_neutral_reward(3.0)
            .validate()
            .is_ok());
        assert!(BanditKnobs::default()
            .with_neutral_reward(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_serialization() {
        let knobs = BanditKnobs::default().with_seed(3);
        let json = serde_json::to_string(&knobs).unwrap();
        let parsed: BanditKnobs = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.seed, Some(3));
        assert!((parsed.exploration_rate - knobs.exploration_rate).abs() < 1e-12);
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let parsed: BanditKnobs = serde_json::from_str(r#"{"exploration_rate": 0.3}"#).unwrap();
        assert!((parsed.exploration_rate - 0.3).abs() < 1e-12);
        assert!(!parsed.sweep_unvisited);
    }
}
