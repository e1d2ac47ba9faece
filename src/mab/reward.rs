//! Latency to reward translation.
//!
//! The policy maximizes mean reward, so every transform here is strictly
//! decreasing in latency. Samples that are missing, non-finite or
//! non-positive are rejected outright rather than mapped to an extreme
//! reward: one corrupt timing sample must not drag an arm's mean.

use serde::{Deserialize, Serialize};

/// Converts a measured latency into a scalar reward.
pub trait RewardTranslator {
    /// Map a latency in microseconds to a reward.
    ///
    /// Returns `None` when the sample must be dropped.
    fn to_reward(&self, latency_us: Option<f64>) -> Option<f64>;
}

/// Built-in latency transforms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardTransform {
    /// `1000 / latency_us`, i.e. reciprocal milliseconds. Always positive.
    #[default]
    Inverse,
    /// `-latency_us`. Always negative.
    Negative,
}

impl RewardTransform {
    /// Finite score below every reward this transform produces.
    pub fn floor(&self) -> f64 {
        match self {
            RewardTransform::Inverse => 0.0,
            RewardTransform::Negative => f64::MIN,
        }
    }

    /// Exclusive upper bound on rewards, if any.
    pub fn ceiling(&self) -> Option<f64> {
        match self {
            RewardTransform::Inverse => None,
            RewardTransform::Negative => Some(0.0),
        }
    }

    /// Recover the latency a reward was derived from.
    pub fn latency_us(&self, reward: f64) -> f64 {
        match self {
            RewardTransform::Inverse => 1000.0 / reward,
            RewardTransform::Negative => -reward,
        }
    }
}

impl RewardTranslator for RewardTransform {
    fn to_reward(&self, latency_us: Option<f64>) -> Option<f64> {
        let latency_us = latency_us.filter(|l| l.is_finite() && *l > 0.0)?;
        let reward = match self {
            RewardTransform::Inverse => 1000.0 / latency_us,
            RewardTransform::Negative => -latency_us,
        };
        reward.is_finite().then_some(reward)
    }
}
