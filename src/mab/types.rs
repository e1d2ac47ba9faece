//! Core types for the bandit tuner.
//!
//! This module defines the vocabulary shared by the store, the policy and
//! the host adapter:
//! - `CollType`/`Topology`/`SizeClass`: what a collective call looks like
//! - `Bucket`: the discretization key statistics are grouped under
//! - `Algorithm`/`Protocol`/`Action`: the arms the bandit chooses between
//! - `CallId`: tracks pending decisions for delayed feedback
//! - `ArmStatistic`: per (bucket, action) accumulator

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TunerError;

/// Collective operation kind, numbered like the host's `ncclFunc_t`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CollType {
    Broadcast,
    Reduce,
    AllGather,
    ReduceScatter,
    AllReduce,
    SendRecv,
    Send,
    Recv,
}

impl CollType {
    const ALL: [CollType; 8] = [
        CollType::Broadcast,
        CollType::Reduce,
        CollType::AllGather,
        CollType::ReduceScatter,
        CollType::AllReduce,
        CollType::SendRecv,
        CollType::Send,
        CollType::Recv,
    ];

    /// Map the host's raw enum value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        usize::try_from(raw)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CollType::Broadcast => "broadcast",
            CollType::Reduce => "reduce",
            CollType::AllGather => "allgather",
            CollType::ReduceScatter => "reducescatter",
            CollType::AllReduce => "allreduce",
            CollType::SendRecv => "sendrecv",
            CollType::Send => "send",
            CollType::Recv => "recv",
        }
    }
}

impl fmt::Display for CollType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollType {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TunerError::InvalidRecord {
                line: s.to_string(),
                reason: "unknown collective type",
            })
    }
}

/// Power-of-two message size class: `SizeClass(k)` covers `[2^k, 2^(k+1))` bytes.
///
/// Messages of 0 or 1 bytes land in class 0.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SizeClass(pub u8);

impl SizeClass {
    pub fn from_bytes(n_bytes: u64) -> Self {
        if n_bytes <= 1 {
            SizeClass(0)
        } else {
            SizeClass((63 - n_bytes.leading_zeros()) as u8)
        }
    }

    /// Lower bound of the class in bytes.
    pub fn floor_bytes(&self) -> u64 {
        1u64 << self.0
    }
}

const SIZE_UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = (self.0 / 10) as usize;
        let mantissa = 1u64 << (self.0 % 10);
        write!(f, "{}{}", mantissa, SIZE_UNITS[unit])
    }
}

impl FromStr for SizeClass {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |reason| TunerError::InvalidRecord {
            line: s.to_string(),
            reason,
        };
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| bad("size class has no unit"))?;
        let (digits, unit) = s.split_at(split);
        let mantissa: u64 = digits.parse().map_err(|_| bad("bad size mantissa"))?;
        let unit_idx = SIZE_UNITS
            .iter()
            .position(|u| u.eq_ignore_ascii_case(unit))
            .ok_or_else(|| bad("unknown size unit"))?;
        if !mantissa.is_power_of_two() || mantissa >= 1024 {
            return Err(bad("size mantissa is not a power of two below 1024"));
        }
        let class = unit_idx as u32 * 10 + mantissa.trailing_zeros();
        if class > 63 {
            return Err(bad("size class out of range"));
        }
        Ok(SizeClass(class as u8))
    }
}

/// Communicator topology hint. All-zero means unknown.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Topology {
    pub nodes: u32,
    pub ranks: u32,
}

impl Topology {
    pub fn new(nodes: u32, ranks: u32) -> Self {
        Self { nodes, ranks }
    }

    pub fn is_unknown(&self) -> bool {
        self.nodes == 0 && self.ranks == 0
    }
}

/// Statistics key: calls with the same bucket share learned statistics.
///
/// Rendered as `allreduce/1MB`, or `allreduce/1MB@1x8` when the topology is known.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Bucket {
    pub coll: CollType,
    pub size: SizeClass,
    pub topology: Topology,
}

impl Bucket {
    /// Derive the bucket for a call shape.
    pub fn new(coll: CollType, n_bytes: u64, topology: Topology) -> Self {
        Self {
            coll,
            size: SizeClass::from_bytes(n_bytes),
            topology,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.coll, self.size)?;
        if !self.topology.is_unknown() {
            write!(f, "@{}x{}", self.topology.nodes, self.topology.ranks)?;
        }
        Ok(())
    }
}

impl FromStr for Bucket {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |reason| TunerError::InvalidRecord {
            line: s.to_string(),
            reason,
        };
        let (coll, rest) = s.split_once('/').ok_or_else(|| bad("bucket missing '/'"))?;
        let (size, topology) = match rest.split_once('@') {
            Some((size, topo)) => {
                let (nodes, ranks) = topo
                    .split_once('x')
                    .ok_or_else(|| bad("topology missing 'x'"))?;
                let nodes = nodes.parse().map_err(|_| bad("bad node count"))?;
                let ranks = ranks.parse().map_err(|_| bad("bad rank count"))?;
                (size, Topology::new(nodes, ranks))
            }
            None => (rest, Topology::default()),
        };
        Ok(Bucket {
            coll: coll.parse()?,
            size: size.parse()?,
            topology,
        })
    }
}

/// Host algorithm, numbered like the host's `NCCL_ALGO_*` indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Algorithm {
    Tree,
    Ring,
    CollNetDirect,
    CollNetChain,
    Nvls,
    NvlsTree,
    Pat,
}

impl Algorithm {
    pub const ALL: [Algorithm; 7] = [
        Algorithm::Tree,
        Algorithm::Ring,
        Algorithm::CollNetDirect,
        Algorithm::CollNetChain,
        Algorithm::Nvls,
        Algorithm::NvlsTree,
        Algorithm::Pat,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Tree => "tree",
            Algorithm::Ring => "ring",
            Algorithm::CollNetDirect => "collnet_direct",
            Algorithm::CollNetChain => "collnet_chain",
            Algorithm::Nvls => "nvls",
            Algorithm::NvlsTree => "nvls_tree",
            Algorithm::Pat => "pat",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.as_str() == s)
    }
}

/// Host protocol, numbered like the host's `NCCL_PROTO_*` indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Protocol {
    Ll,
    Ll128,
    Simple,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Ll, Protocol::Ll128, Protocol::Simple];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ll => "ll",
            Protocol::Ll128 => "ll128",
            Protocol::Simple => "simple",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == s)
    }
}

/// Number of distinct action slots: (7 algorithms + any) x (3 protocols + any).
pub const ACTION_SLOTS: usize = (Algorithm::ALL.len() + 1) * (Protocol::ALL.len() + 1);

/// One arm of the bandit: an optional algorithm and an optional protocol.
///
/// `None` on either side leaves that dimension to the host; `Action::AUTO`
/// leaves both, i.e. defers the whole choice to the host's own tuning.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Action {
    pub algorithm: Option<Algorithm>,
    pub protocol: Option<Protocol>,
}

impl Action {
    pub const AUTO: Action = Action {
        algorithm: None,
        protocol: None,
    };

    pub const fn pair(algorithm: Algorithm, protocol: Protocol) -> Self {
        Self {
            algorithm: Some(algorithm),
            protocol: Some(protocol),
        }
    }

    pub const fn protocol(protocol: Protocol) -> Self {
        Self {
            algorithm: None,
            protocol: Some(protocol),
        }
    }

    pub const fn algorithm(algorithm: Algorithm) -> Self {
        Self {
            algorithm: Some(algorithm),
            protocol: None,
        }
    }

    pub fn is_auto(&self) -> bool {
        *self == Self::AUTO
    }

    /// Dense slot index in `0..ACTION_SLOTS`; `AUTO` is 0.
    ///
    /// Used both for store addressing and for deterministic tie-breaking.
    pub fn index(&self) -> usize {
        let algo = self.algorithm.map_or(0, |a| a.index() + 1);
        let proto = self.protocol.map_or(0, |p| p.index() + 1);
        algo * (Protocol::ALL.len() + 1) + proto
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.algorithm, self.protocol) {
            (None, None) => f.write_str("auto"),
            (Some(a), None) => f.write_str(a.as_str()),
            (None, Some(p)) => f.write_str(p.as_str()),
            (Some(a), Some(p)) => write!(f, "{}/{}", a.as_str(), p.as_str()),
        }
    }
}

impl FromStr for Action {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let invalid = || TunerError::InvalidAction(s.to_string());
        if lower == "auto" {
            return Ok(Action::AUTO);
        }
        if let Some((algo, proto)) = lower.split_once('/') {
            let algo = Algorithm::parse(algo).ok_or_else(invalid)?;
            let proto = Protocol::parse(proto).ok_or_else(invalid)?;
            return Ok(Action::pair(algo, proto));
        }
        if let Some(p) = Protocol::parse(&lower) {
            return Ok(Action::protocol(p));
        }
        Algorithm::parse(&lower)
            .map(Action::algorithm)
            .ok_or_else(invalid)
    }
}

impl TryFrom<String> for Action {
    type Error = TunerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Action> for String {
    fn from(a: Action) -> Self {
        a.to_string()
    }
}

/// Identifier of an in-flight call, used to match `report` to `decide`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CallId(pub u64);

/// Statistics for a single (bucket, action) arm.
///
/// The mean is maintained incrementally (`mean += (r - mean) / n`) so it
/// never accumulates an unbounded sum.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ArmStatistic {
    /// Number of rewards folded in (monotonically non-decreasing)
    pub pulls: u64,
    /// Running mean reward
    pub mean_reward: f64,
}

impl ArmStatistic {
    /// Fold one reward into the running mean.
    pub fn record(&mut self, reward: f64) {
        self.pulls += 1;
        self.mean_reward += (reward - self.mean_reward) / self.pulls as f64;
    }

    /// Cumulative reward implied by the mean.
    pub fn cumulative_reward(&self) -> f64 {
        self.mean_reward * self.pulls as f64
    }

    /// Mean reward, or `neutral` if the arm was never pulled.
    pub fn mean_or(&self, neutral: f64) -> f64 {
        if self.pulls == 0 {
            neutral
        } else {
            self.mean_reward
        }
    }
}

/// How a decision was reached.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DecisionMode {
    /// Uniform random pick (probability epsilon)
    Explore,
    /// Highest mean reward
    Exploit,
    /// Forced visit of an unvisited arm
    Sweep,
    /// Bucket capacity exhausted; no learning for this call
    Untracked,
}
