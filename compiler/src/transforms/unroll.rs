//! Loop Unrolling
//!
//! Unrolling by a factor `f` turns a loop into a main loop whose step is
//! `f * step` and whose body holds `f` copies of the original body (copy
//! `k` sees `iv + k * step`), followed by a cleanup loop running the
//! remaining iterations. The cleanup loop is omitted when `f` divides a
//! constant trip count.

use super::{verify, AffinePass, ConfigError, OptimizationResult, PassError};
use crate::affine::{AffineExpr, AffineMap};
use crate::analysis::loops::{
    annotate_trip_count, cleanup_lower_bound, constant_trip_count, innermost_loops, largest_divisor_at_most,
    promote_if_single_iteration, upper_bound_for_multiple,
};
use crate::ir::{BlockId, Function, IrType, OpId, OpKind, ValueId};
use fxhash::FxHashMap;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Factor used when the unroll factor is left unspecified.
pub const DEFAULT_UNROLL_FACTOR: u64 = 4;

/// Per-loop factor selection supplied by the caller.
pub type UnrollFactorFn = Arc<dyn Fn(&Function, OpId) -> u64 + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct UnrollOptions {
    /// Unroll factor; -1 selects [`DEFAULT_UNROLL_FACTOR`]
    pub unroll_factor: i64,
    /// Reduce the factor to a divisor of a constant trip count
    pub unroll_up_to_factor: bool,
    /// Unroll loops with a constant trip count completely
    pub unroll_full: bool,
    /// With `unroll_full`, only loops with at most this many iterations
    /// are unrolled; -1 disables the threshold
    pub unroll_full_threshold: i64,
    /// How many times innermost loops are unrolled
    pub num_repetitions: u32,
}

impl Default for UnrollOptions {
    fn default() -> Self {
        Self {
            unroll_factor: -1,
            unroll_up_to_factor: false,
            unroll_full: false,
            unroll_full_threshold: -1,
            num_repetitions: 1,
        }
    }
}

#[derive(Clone, Default)]
pub struct LoopUnroll {
    options: UnrollOptions,
    factor_fn: Option<UnrollFactorFn>,
}

impl fmt::Debug for LoopUnroll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopUnroll")
            .field("options", &self.options)
            .field("factor_fn", &self.factor_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl LoopUnroll {
    pub fn new(options: UnrollOptions) -> Result<Self, ConfigError> {
        if options.unroll_factor == 0 || options.unroll_factor < -1 {
            return Err(ConfigError::NonPositiveFactor {
                option: "unrollFactor",
                value: options.unroll_factor,
            });
        }
        if options.unroll_full_threshold == 0 || options.unroll_full_threshold < -1 {
            return Err(ConfigError::NonPositiveFactor {
                option: "unrollFullThreshold",
                value: options.unroll_full_threshold,
            });
        }
        if options.num_repetitions == 0 {
            return Err(ConfigError::NonPositiveFactor {
                option: "numRepetitions",
                value: 0,
            });
        }
        Ok(Self {
            options,
            factor_fn: None,
        })
    }

    pub fn with_factor(factor: i64) -> Result<Self, ConfigError> {
        Self::new(UnrollOptions {
            unroll_factor: factor,
            ..UnrollOptions::default()
        })
    }

    /// Choose the factor of every loop with `factor_fn`, overriding the
    /// configured factor.
    pub fn with_factor_fn(mut self, factor_fn: UnrollFactorFn) -> Self {
        self.factor_fn = Some(factor_fn);
        self
    }

    pub fn factor(&self) -> u64 {
        if self.options.unroll_factor == -1 {
            DEFAULT_UNROLL_FACTOR
        } else {
            self.options.unroll_factor as u64
        }
    }

    fn unroll_one(&self, func: &mut Function, lp: OpId) -> bool {
        if let Some(factor_fn) = &self.factor_fn {
            let factor = factor_fn(func, lp);
            return factor > 0 && loop_unroll_by_factor(func, lp, factor);
        }
        if self.options.unroll_full {
            return loop_unroll_full(func, lp);
        }
        if self.options.unroll_up_to_factor {
            return loop_unroll_up_to_factor(func, lp, self.factor());
        }
        loop_unroll_by_factor(func, lp, self.factor())
    }
}

impl AffinePass for LoopUnroll {
    fn name(&self) -> &'static str {
        "affine-loop-unroll"
    }

    fn run_on_function(&self, func: &mut Function) -> Result<OptimizationResult, PassError> {
        verify(func)?;
        let mut unrolled = 0;
        if self.options.unroll_full && self.options.unroll_full_threshold > 0 {
            let threshold = self.options.unroll_full_threshold as u64;
            for lp in func.loops_post_order() {
                if !func.is_live(lp) {
                    continue;
                }
                if constant_trip_count(func, lp).is_some_and(|tc| tc <= threshold) && loop_unroll_full(func, lp) {
                    unrolled += 1;
                }
            }
        } else {
            for _ in 0..self.options.num_repetitions {
                let loops = innermost_loops(func);
                if loops.is_empty() {
                    break;
                }
                for lp in loops {
                    if func.is_live(lp) && self.unroll_one(func, lp) {
                        unrolled += 1;
                    }
                }
            }
        }
        let mut result = OptimizationResult::unchanged();
        result.record("loops_unrolled", unrolled);
        if unrolled > 0 {
            info!("unrolled {} loops in {}", unrolled, func.name);
        }
        Ok(result)
    }
}

/// Unroll a loop with a constant trip count completely.
pub fn loop_unroll_full(func: &mut Function, lp: OpId) -> bool {
    match constant_trip_count(func, lp) {
        Some(0) | None => false,
        Some(1) => promote_if_single_iteration(func, lp),
        Some(tc) => loop_unroll_by_factor(func, lp, tc),
    }
}

/// Unroll by `factor`, or by the largest divisor of a constant trip count
/// not exceeding it.
pub fn loop_unroll_up_to_factor(func: &mut Function, lp: OpId, factor: u64) -> bool {
    match constant_trip_count(func, lp) {
        Some(0) => false,
        Some(tc) => loop_unroll_by_factor(func, lp, largest_divisor_at_most(tc, factor)),
        None => loop_unroll_by_factor(func, lp, factor),
    }
}

/// Unroll by `factor`, adding a cleanup loop when needed. Returns whether
/// the loop changed.
pub fn loop_unroll_by_factor(func: &mut Function, lp: OpId, factor: u64) -> bool {
    let Some(l) = func.loop_op(lp).cloned() else {
        return false;
    };
    if factor == 1 {
        return promote_if_single_iteration(func, lp);
    }
    if func.block(l.body).ops.is_empty() {
        return false;
    }
    let trip_count = constant_trip_count(func, lp);
    if trip_count.is_some_and(|tc| tc < factor) {
        debug!("trip count of {} is below the unroll factor {}", lp, factor);
        return false;
    }

    let needs_cleanup = trip_count.map_or(true, |tc| tc % factor != 0);
    let cleanup = if needs_cleanup {
        let Some(main_upper) = upper_bound_for_multiple(func, lp, factor) else {
            debug!("cannot compute the unrolled upper bound of {}", lp);
            return false;
        };
        let block = func.op(lp).parent;
        let index = func.position_in_block(lp) + 1;
        let mut mapping = FxHashMap::default();
        let Some(cleanup_lower) = cleanup_lower_bound(func, lp, &main_upper) else {
            return false;
        };
        let cleanup = func.clone_op_into(lp, block, index, &mut mapping);
        func.loop_op_mut(cleanup).lower = cleanup_lower;
        func.loop_op_mut(lp).upper = main_upper;
        Some(cleanup)
    } else {
        None
    };

    func.loop_op_mut(lp).step = l.step * factor as i64;
    replicate_body(func, l.body, l.iv, l.step, factor);
    trace!("unrolled {} by {}", lp, factor);

    annotate_trip_count(func, lp);
    if let Some(cleanup) = cleanup {
        annotate_trip_count(func, cleanup);
        promote_if_single_iteration(func, cleanup);
    }
    promote_if_single_iteration(func, lp);
    true
}

/// Append `factor - 1` copies of the current contents of `body`; copy `k`
/// sees `iv + k * step` in place of `iv`.
pub fn replicate_body(func: &mut Function, body: BlockId, iv: ValueId, step: i64, factor: u64) {
    let originals = func.block(body).ops.clone();
    let iv_used = func.has_uses(iv);
    for k in 1..factor as i64 {
        let mut mapping = FxHashMap::default();
        if iv_used {
            let end = func.block(body).ops.len();
            let shifted = offset_iv(func, body, end, iv, k * step);
            mapping.insert(iv, shifted);
        }
        for &op in &originals {
            let end = func.block(body).ops.len();
            func.clone_op_into(op, body, end, &mut mapping);
        }
    }
}

/// Insert `apply (d0) -> (d0 + offset)` of `iv` at `index` of `block`.
pub fn offset_iv(func: &mut Function, block: BlockId, index: usize, iv: ValueId, offset: i64) -> ValueId {
    let map = AffineMap::new(1, 0, vec![AffineExpr::dim(0) + offset]);
    let op = func.insert_op(block, index, OpKind::Apply { map, operands: vec![iv] }, vec![IrType::index()]);
    func.op(op).results[0]
}
