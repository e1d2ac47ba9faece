//! Host-side vocabulary: result codes and the per-call cost table.
//!
//! The host hands the tuner a `numAlgo x numProto` table of estimated costs
//! laid out row-major by algorithm. A cell holding [`ALGO_PROTO_IGNORE`] is
//! infeasible for the call; the host picks the cheapest remaining cell. The
//! tuner steers by zeroing the cell of the action it chose.

use std::ffi::c_int;

use crate::error::TunerError;
use crate::mab::{Action, Algorithm, Protocol};

/// Marks an (algorithm, protocol) pair the host will not use for this call.
pub const ALGO_PROTO_IGNORE: f32 = -1.0;

/// Host result codes.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NcclResult {
    Success = 0,
    SystemError = 2,
    InternalError = 3,
    InvalidArgument = 4,
    InvalidUsage = 5,
}

impl NcclResult {
    pub fn code(self) -> c_int {
        self as c_int
    }
}

impl From<&TunerError> for NcclResult {
    fn from(err: &TunerError) -> Self {
        match err {
            TunerError::TelemetryOpen { .. } => NcclResult::SystemError,
            e if e.is_contract_violation() => NcclResult::InvalidUsage,
            _ => NcclResult::InvalidArgument,
        }
    }
}

/// Mutable view over the host's cost table for one call.
#[derive(Debug)]
pub struct CostTable<'a> {
    cells: &'a mut [f32],
    num_algo: usize,
    num_proto: usize,
}

impl<'a> CostTable<'a> {
    /// Wrap a row-major table. Returns None if the dimensions do not match.
    pub fn new(cells: &'a mut [f32], num_algo: usize, num_proto: usize) -> Option<Self> {
        (cells.len() == num_algo.checked_mul(num_proto)?).then_some(Self {
            cells,
            num_algo,
            num_proto,
        })
    }

    /// Wrap the host's table pointer.
    ///
    /// Returns None for a null table or negative dimensions.
    ///
    /// # Safety
    ///
    /// `table` must point to `num_algo * num_proto` contiguous, writable
    /// floats that stay valid and unaliased for `'a`.
    pub unsafe fn from_raw(table: *mut *mut f32, num_algo: c_int, num_proto: c_int) -> Option<Self> {
        if table.is_null() {
            return None;
        }
        let num_algo = usize::try_from(num_algo).ok()?;
        let num_proto = usize::try_from(num_proto).ok()?;
        let len = num_algo.checked_mul(num_proto)?;
        let cells = std::slice::from_raw_parts_mut(table.cast::<f32>(), len);
        Self::new(cells, num_algo, num_proto)
    }

    /// Cost of a cell, or None if out of range or ignored.
    pub fn cost(&self, algo: usize, proto: usize) -> Option<f32> {
        if algo >= self.num_algo || proto >= self.num_proto {
            return None;
        }
        let cost = self.cells[algo * self.num_proto + proto];
        (cost != ALGO_PROTO_IGNORE).then_some(cost)
    }

    /// The cell an action maps to for this call, if any.
    ///
    /// A partial action (protocol only, or algorithm only) maps to its
    /// cheapest feasible cell, ties to the lowest index. `auto` maps to no
    /// cell.
    pub fn feasible(&self, action: Action) -> Option<(usize, usize)> {
        if action.is_auto() {
            return None;
        }
        let algos = match action.algorithm {
            Some(a) => a.index()..a.index() + 1,
            None => 0..Algorithm::ALL.len(),
        };
        let protos = match action.protocol {
            Some(p) => p.index()..p.index() + 1,
            None => 0..Protocol::ALL.len(),
        };

        let mut best: Option<((usize, usize), f32)> = None;
        for algo in algos {
            for proto in protos.clone() {
                let Some(cost) = self.cost(algo, proto) else {
                    continue;
                };
                if best.map_or(true, |(_, c)| cost < c) {
                    best = Some(((algo, proto), cost));
                }
            }
        }
        best.map(|(cell, _)| cell)
    }

    /// Filter `candidates` to what this call allows. `auto` is always first.
    pub fn legal_actions(&self, candidates: &[Action]) -> Vec<Action> {
        let mut legal = vec![Action::AUTO];
        for &action in candidates {
            if !legal.contains(&action) && self.feasible(action).is_some() {
                legal.push(action);
            }
        }
        legal
    }

    /// Make `action` the host's cheapest choice. Returns the steered cell.
    pub fn steer(&mut self, action: Action) -> Option<(usize, usize)> {
        let (algo, proto) = self.feasible(action)?;
        self.cells[algo * self.num_proto + proto] = 0.0;
        Some((algo, proto))
    }
}
