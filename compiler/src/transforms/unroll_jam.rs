//! Unroll and Jam
//!
//! Unrolls an outer loop by a factor and fuses the copies of each nested
//! loop into one: straight-line code is replicated in place, nested loops
//! are shared and their bodies replicated recursively. Nested loop bounds
//! must not depend on the outer loop, and no dependence carried by the
//! outer loop may be reversed by interleaving the copies.

use super::unroll::{offset_iv, DEFAULT_UNROLL_FACTOR};
use super::{verify, AffinePass, ConfigError, OptimizationResult, PassError};
use crate::analysis::dependence::{dependences_in, num_common_loops};
use crate::analysis::loops::{
    annotate_trip_count, band_roots, bound_is_invariant, cleanup_lower_bound, constant_trip_count, has_nested_loops,
    loop_depth, promote_if_single_iteration, upper_bound_for_multiple,
};
use crate::ir::{BlockId, Function, OpId, ValueId};
use fxhash::FxHashMap;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

/// Factor used when the unroll-jam factor is left unspecified.
pub const DEFAULT_UNROLL_JAM_FACTOR: u64 = DEFAULT_UNROLL_FACTOR;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct UnrollJamOptions {
    /// Unroll-jam factor; -1 selects [`DEFAULT_UNROLL_JAM_FACTOR`]
    pub unroll_jam_factor: i64,
}

impl Default for UnrollJamOptions {
    fn default() -> Self {
        Self { unroll_jam_factor: -1 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopUnrollAndJam {
    options: UnrollJamOptions,
}

impl LoopUnrollAndJam {
    pub fn new(options: UnrollJamOptions) -> Result<Self, ConfigError> {
        if options.unroll_jam_factor == 0 || options.unroll_jam_factor < -1 {
            return Err(ConfigError::NonPositiveFactor {
                option: "unrollJamFactor",
                value: options.unroll_jam_factor,
            });
        }
        Ok(Self { options })
    }

    pub fn with_factor(factor: i64) -> Result<Self, ConfigError> {
        Self::new(UnrollJamOptions {
            unroll_jam_factor: factor,
        })
    }

    pub fn factor(&self) -> u64 {
        match self.options.unroll_jam_factor {
            -1 => DEFAULT_UNROLL_JAM_FACTOR,
            f => f as u64,
        }
    }
}

impl AffinePass for LoopUnrollAndJam {
    fn name(&self) -> &'static str {
        "affine-loop-unroll-jam"
    }

    fn run_on_function(&self, func: &mut Function) -> Result<OptimizationResult, PassError> {
        verify(func)?;
        let mut jammed = 0;
        for root in band_roots(func) {
            if has_nested_loops(func, root) && loop_unroll_jam_by_factor(func, root, self.factor()) {
                jammed += 1;
            }
        }
        let mut result = OptimizationResult::unchanged();
        result.record("loops_unroll_jammed", jammed);
        if jammed > 0 {
            info!("unroll-jammed {} loops in {}", jammed, func.name);
        }
        Ok(result)
    }
}

/// Whether jamming the copies of `lp` preserves every dependence.
pub fn is_unroll_jam_legal(func: &Function, lp: OpId) -> bool {
    if !func.is_loop(lp) {
        return false;
    }
    for op in func.walk_nested(lp) {
        let Some(inner) = func.loop_op(op) else {
            continue;
        };
        if !bound_is_invariant(func, &inner.lower, lp) || !bound_is_invariant(func, &inner.upper, lp) {
            debug!("bounds of {} depend on {}", op, lp);
            return false;
        }
        let mut parent = func.parent_op(op);
        while let Some(p) = parent.filter(|&p| p != lp) {
            if !func.is_loop(p) {
                debug!("{} is nested under a conditional", op);
                return false;
            }
            parent = func.parent_op(p);
        }
    }

    let depth = loop_depth(func, lp) + 1;
    let Some(deps) = dependences_in(func, lp, depth..=depth) else {
        return false;
    };
    deps.iter().all(|(src, dst, components)| {
        // Carried by `lp`: both ends must share a jammed loop, and the
        // inner distances must not go backwards.
        num_common_loops(func, *src, *dst) > depth && components.iter().skip(depth).all(|c| c.is_non_negative())
    })
}

/// Unroll `lp` by `factor` and jam the copies of its nested loops.
pub fn loop_unroll_jam_by_factor(func: &mut Function, lp: OpId, factor: u64) -> bool {
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
        return false;
    }
    if !is_unroll_jam_legal(func, lp) {
        debug!("unroll-jam of {} is not legal", lp);
        return false;
    }

    let needs_cleanup = trip_count.map_or(true, |tc| tc % factor != 0);
    let cleanup = if needs_cleanup {
        let Some(main_upper) = upper_bound_for_multiple(func, lp, factor) else {
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
    let ops = func.block(l.body).ops.clone();
    let iv_used = func.has_uses(l.iv);
    let mut mappings: Vec<FxHashMap<ValueId, ValueId>> = (1..factor as i64)
        .map(|k| {
            let mut mapping = FxHashMap::default();
            if iv_used {
                let index = (k - 1) as usize;
                mapping.insert(l.iv, offset_iv(func, l.body, index, l.iv, k * l.step));
            }
            mapping
        })
        .collect();
    jam_block(func, l.body, &ops, &mut mappings);
    trace!("unroll-jammed {} by {}", lp, factor);

    annotate_trip_count(func, lp);
    if let Some(cleanup) = cleanup {
        annotate_trip_count(func, cleanup);
        promote_if_single_iteration(func, cleanup);
    }
    promote_if_single_iteration(func, lp);
    true
}

/// Replicate each run of straight-line operations of `ops` once per
/// mapping, right after the run; recurse into nested loops.
fn jam_block(func: &mut Function, block: BlockId, ops: &[OpId], mappings: &mut [FxHashMap<ValueId, ValueId>]) {
    let mut i = 0;
    while i < ops.len() {
        if let Some(body) = func.loop_op(ops[i]).map(|l| l.body) {
            let inner_ops = func.block(body).ops.clone();
            jam_block(func, body, &inner_ops, mappings);
            i += 1;
            continue;
        }
        let start = i;
        while i < ops.len() && !func.is_loop(ops[i]) {
            i += 1;
        }
        let mut insert_at = func.position_in_block(ops[i - 1]) + 1;
        for mapping in mappings.iter_mut() {
            for &op in &ops[start..i] {
                func.clone_op_into(op, block, insert_at, mapping);
                insert_at += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::{AffineExpr, AffineMap};
    use crate::ir::interp::{run, ArgValue, Scalar};
    use crate::ir::{AffineBound, ElementType, IrType, MemRefType, OpBuilder};

    /// for i in 0..n { for j in 0..4 { C[i][j] = A[i + di][j + dj] + 1 } }
    fn nest(n: i64, same_array: bool, di: i64, dj: i64) -> (Function, OpId, OpId) {
        let ty = IrType::MemRef(MemRefType::new(vec![16, 8], ElementType::I64));
        let mut func = Function::new("f", vec![ty.clone(), ty]);
        let c = func.arguments[0];
        let a = if same_array { c } else { func.arguments[1] };
        let body = func.body;
        let outer = OpBuilder::at_end(&mut func, body).constant_for(1, n, 1);
        let ol = func.loop_op(outer).unwrap().clone();
        let inner = OpBuilder::at_end(&mut func, ol.body).constant_for(1, 5, 1);
        let il = func.loop_op(inner).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, il.body);
        let map = AffineMap::new(2, 0, vec![AffineExpr::dim(0) + di, AffineExpr::dim(1) + dj]);
        let v = b.load(a, map, vec![ol.iv, il.iv]);
        let one = b.constant_int(1, ElementType::I64);
        let w = b.add(v, one);
        b.store(w, c, AffineMap::identity(2), vec![ol.iv, il.iv]);
        (func, outer, inner)
    }

    fn args() -> Vec<ArgValue> {
        let data: Vec<Scalar> = (0..128).map(Scalar::Int).collect();
        vec![ArgValue::Buffer(data.clone()), ArgValue::Buffer(data)]
    }

    #[test]
    fn test_jam_shares_inner_loop() {
        let (mut func, outer, inner) = nest(9, false, 0, 0);
        let before = run(&func, args()).unwrap();
        assert!(loop_unroll_jam_by_factor(&mut func, outer, 2));
        assert_eq!(func.loop_op(outer).unwrap().step, 2);
        let inner_body = func.loop_op(inner).unwrap().body;
        let stores = func
            .block(inner_body)
            .ops
            .iter()
            .filter(|&&op| func.op(op).kind.is_store())
            .count();
        assert_eq!(stores, 2);
        let after = run(&func, args()).unwrap();
        assert_eq!(before.buffers, after.buffers);
    }

    #[test]
    fn test_reversed_dependence_is_rejected() {
        // C[i][j] = C[i - 1][j + 1] + 1: distance (1, -1).
        let (mut func, outer, _) = nest(9, true, -1, 1);
        assert!(!is_unroll_jam_legal(&func, outer));
        assert!(!loop_unroll_jam_by_factor(&mut func, outer, 2));
    }

    #[test]
    fn test_forward_dependence_is_accepted() {
        // C[i][j] = C[i - 1][j - 1] + 1: distance (1, 1).
        let (mut func, outer, _) = nest(9, true, -1, -1);
        let before = run(&func, args()).unwrap();
        assert!(loop_unroll_jam_by_factor(&mut func, outer, 4));
        let after = run(&func, args()).unwrap();
        assert_eq!(before.buffers, after.buffers);
    }

    #[test]
    fn test_symbolic_empty_range_runs_no_cleanup() {
        // for i in 0..n { for j in 0..4 { A[i][j] = i } }
        for n_value in [-3, -1, 0, 1, 13] {
            let mut func = Function::new(
                "f",
                vec![IrType::index(), IrType::MemRef(MemRefType::new(vec![16, 4], ElementType::Index))],
            );
            let (n, a) = (func.arguments[0], func.arguments[1]);
            let body = func.body;
            let ub = AffineBound {
                map: AffineMap::new(0, 1, vec![AffineExpr::symbol(0)]),
                operands: vec![n],
            };
            let outer = OpBuilder::at_end(&mut func, body).for_loop(AffineBound::constant(0), ub, 1);
            let ol = func.loop_op(outer).unwrap().clone();
            let inner = OpBuilder::at_end(&mut func, ol.body).constant_for(0, 4, 1);
            let il = func.loop_op(inner).unwrap().clone();
            OpBuilder::at_end(&mut func, il.body).store(ol.iv, a, AffineMap::identity(2), vec![ol.iv, il.iv]);

            let args = || vec![ArgValue::Index(n_value), ArgValue::Buffer(vec![Scalar::Int(0); 64])];
            let before = run(&func, args()).unwrap();
            assert!(loop_unroll_jam_by_factor(&mut func, outer, 4));
            let after = run(&func, args()).unwrap();
            assert_eq!(before.buffers, after.buffers, "n = {}", n_value);
        }
    }

    #[test]
    fn test_pass_uses_default_factor() {
        let (mut func, outer, _) = nest(9, false, 0, 0);
        let result = LoopUnrollAndJam::default().run_on_function(&mut func).unwrap();
        assert_eq!(result.stat("loops_unroll_jammed"), 1);
        assert_eq!(func.loop_op(outer).unwrap().step, 4);
    }
}
