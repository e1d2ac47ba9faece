//! Epsilon-greedy selection over the store.
//!
//! The policy holds no statistics of its own: it reads arms from a
//! [`DecisionRecordStore`] owned by the caller and writes rewards back into
//! it. The only state here is the RNG.

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::knobs::BanditKnobs;
use super::store::{ArmTable, DecisionRecordStore};
use super::types::{Action, Bucket, DecisionMode};
use crate::error::{Result, TunerError};

/// Turns store state into an action for a call, and rewards back into state.
pub trait SelectionPolicy: Send + Sync {
    /// Pick one of `legal` for `bucket`.
    ///
    /// The returned action is always an element of `legal`. An empty `legal`
    /// is a caller contract violation.
    fn select(
        &self,
        store: &DecisionRecordStore,
        bucket: Bucket,
        legal: &[Action],
    ) -> Result<(Action, DecisionMode)>;

    /// Record the reward observed for a previous selection.
    ///
    /// Returns false if the bucket is not tracked and nothing was learned.
    fn update(
        &self,
        store: &DecisionRecordStore,
        bucket: Bucket,
        action: Action,
        reward: f64,
    ) -> bool {
        store.update(bucket, action, reward)
    }
}

/// Epsilon-greedy bandit.
///
/// # Example
///
/// ```
/// use nccl_bandit_tuner::mab::{
///     Action, BanditKnobs, Bucket, CollType, DecisionRecordStore, EpsilonGreedy, Protocol,
///     SelectionPolicy, Topology,
/// };
///
/// let store = DecisionRecordStore::new(64);
/// let policy = EpsilonGreedy::new(BanditKnobs::default().with_seed(1));
/// let bucket = Bucket::new(CollType::AllReduce, 1 << 20, Topology::default());
/// let legal = [Action::AUTO, Action::protocol(Protocol::Simple)];
///
/// let (action, _mode) = policy.select(&store, bucket, &legal).unwrap();
/// assert!(legal.contains(&action));
/// policy.update(&store, bucket, action, 0.5);
/// ```
pub struct EpsilonGreedy {
    knobs: BanditKnobs,
    rng: Mutex<SmallRng>,
}

impl EpsilonGreedy {
    /// Create a policy from knobs. A missing seed draws one from entropy.
    pub fn new(knobs: BanditKnobs) -> Self {
        let rng = match knobs.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            knobs,
            rng: Mutex::new(rng),
        }
    }

    /// Get the knobs configuration.
    pub fn knobs(&self) -> &BanditKnobs {
        &self.knobs
    }

    /// Fallback for buckets the store refused: prefer deferring to the host.
    fn untracked(legal: &[Action]) -> Action {
        if legal.contains(&Action::AUTO) {
            Action::AUTO
        } else {
            legal[0]
        }
    }

    /// Lowest-index legal arm with zero pulls.
    fn first_unvisited(arms: &ArmTable, legal: &[Action]) -> Option<Action> {
        legal
            .iter()
            .copied()
            .filter(|a| arms[a.index()].pulls == 0)
            .min_by_key(|a| a.index())
    }

    /// Highest mean reward, ties to the lowest action index.
    fn greedy(&self, arms: &ArmTable, legal: &[Action]) -> Action {
        let neutral = self.knobs.neutral_score();
        let mut best = legal[0];
        let mut best_mean = arms[best.index()].mean_or(neutral);
        for &action in &legal[1..] {
            let mean = arms[action.index()].mean_or(neutral);
            if mean > best_mean || (mean == best_mean && action.index() < best.index()) {
                best = action;
                best_mean = mean;
            }
        }
        best
    }
}

impl SelectionPolicy for EpsilonGreedy {
    fn select(
        &self,
        store: &DecisionRecordStore,
        bucket: Bucket,
        legal: &[Action],
    ) -> Result<(Action, DecisionMode)> {
        if legal.is_empty() {
            return Err(TunerError::NoLegalActions(bucket.to_string()));
        }
        if !store.admit(bucket) {
            return Ok((Self::untracked(legal), DecisionMode::Untracked));
        }

        // Draw before touching the store so the RNG lock is never held
        // together with a bucket lock.
        let explore_pick = {
            let mut rng = self.rng.lock();
            if rng.gen::<f64>() < self.knobs.exploration_rate {
                Some(legal[rng.gen_range(0..legal.len())])
            } else {
                None
            }
        };

        let sweep = self.knobs.sweep_unvisited;
        let decision = store.with_arms(bucket, |arms| {
            if sweep {
                if let Some(action) = Self::first_unvisited(arms, legal) {
                    return (action, DecisionMode::Sweep);
                }
            }
            match explore_pick {
                Some(action) => (action, DecisionMode::Explore),
                None => (self.greedy(arms, legal), DecisionMode::Exploit),
            }
        });

        // admit() succeeded, so the bucket is tracked for good.
        Ok(decision.unwrap_or((Self::untracked(legal), DecisionMode::Untracked)))
    }
}
