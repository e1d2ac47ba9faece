//! Multi-Armed Bandit (MAB) core: the learning half of the tuner.
//!
//! Every collective call maps to a [`Bucket`]. For each bucket the
//! [`DecisionRecordStore`] keeps one [`ArmStatistic`] per [`Action`], and an
//! [`EpsilonGreedy`] policy picks among the actions the host offers as legal.
//!
//! # Flow
//!
//! ```ignore
//! let (action, mode) = policy.select(&store, bucket, &legal)?;
//! // ... host runs the collective with `action` ...
//! if let Some(reward) = knobs.reward.to_reward(Some(latency_us)) {
//!     policy.update(&store, bucket, action, reward);
//! }
//! ```
//!
//! # Rewards
//!
//! The policy maximizes mean reward, and [`RewardTransform`] maps lower
//! latency to higher reward. An unvisited arm scores the transform's floor
//! (0.0 for inverse, `f64::MIN` for negative) unless `neutral_reward` pins
//! it, so it never beats an arm that has actually been measured; unvisited
//! arms are found by exploration, or by the optional sweep.

mod knobs;
mod policy;
mod reward;
mod store;
mod types;

pub use knobs::BanditKnobs;
pub use policy::{EpsilonGreedy, SelectionPolicy};
pub use reward::{RewardTransform, RewardTranslator};
pub use store::{ArmTable, DecisionRecordStore};
pub use types::{
    Action, Algorithm, ArmStatistic, Bucket, CallId, CollType, DecisionMode, Protocol, SizeClass,
    Topology, ACTION_SLOTS,
};
