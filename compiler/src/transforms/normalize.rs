//! Loop Normalization
//!
//! Rewrites loops with single-result bounds to run from 0 with step 1 up
//! to their trip count, recomputing the original induction variable as
//! `lb + iv * step` at the top of the body. Loops that run exactly once are
//! replaced by their body.

use super::{verify, AffinePass, OptimizationResult, PassError};
use crate::affine::{AffineExpr, AffineMap};
use crate::analysis::loops::{annotate_trip_count, promote_if_single_iteration, trip_count_map};
use crate::ir::{AffineBound, Function, IrType, OpId, OpKind};
use log::{debug, trace};

#[derive(Debug, Clone, Default)]
pub struct LoopNormalize;

impl LoopNormalize {
    pub fn new() -> Self {
        Self
    }
}

impl AffinePass for LoopNormalize {
    fn name(&self) -> &'static str {
        "affine-loop-normalize"
    }

    fn run_on_function(&self, func: &mut Function) -> Result<OptimizationResult, PassError> {
        verify(func)?;
        let mut result = OptimizationResult::unchanged();
        let mut promoted = 0;
        let mut normalized = 0;
        for lp in func.loops() {
            if !func.is_live(lp) {
                continue;
            }
            if promote_if_single_iteration(func, lp) {
                promoted += 1;
            } else if normalize_loop(func, lp) {
                normalized += 1;
            }
        }
        result.record("loops_promoted", promoted);
        result.record("loops_normalized", normalized);
        if result.modified {
            debug!("normalized loops in {}: {:?}", func.name, result.stats);
        }
        Ok(result)
    }
}

/// Normalize one loop. Returns false when it is already normalized or has
/// multi-result bounds.
pub fn normalize_loop(func: &mut Function, lp: OpId) -> bool {
    let Some(l) = func.loop_op(lp).cloned() else {
        return false;
    };
    if l.lower.as_constant() == Some(0) && l.step == 1 {
        return false;
    }
    let Some(tc) = trip_count_map(func, lp) else {
        return false;
    };
    trace!("normalizing loop {}", lp);

    // lb(d1.., s..) + d0 * step
    let lb = &l.lower.map;
    let expr = lb.results[0].shift_dims(1) + AffineExpr::dim(0) * l.step;
    let map = AffineMap::new(lb.num_dims + 1, lb.num_symbols, vec![expr.simplify()]);
    let mut operands = vec![l.iv];
    operands.extend(l.lower.operands.iter().copied());
    let apply_op = func.insert_op(l.body, 0, OpKind::Apply { map, operands }, vec![IrType::index()]);
    let apply = func.op(apply_op).results[0];
    func.replace_uses_in_block(l.body, l.iv, apply);
    if let OpKind::Apply { operands, .. } = &mut func.op_mut(apply_op).kind {
        operands[0] = l.iv;
    }

    let upper = match tc.map.single_constant_result() {
        Some(c) => AffineBound::constant(c),
        None => AffineBound {
            map: tc.map,
            operands: tc.operands,
        },
    };
    let lm = func.loop_op_mut(lp);
    lm.lower = AffineBound::constant(0);
    lm.upper = upper;
    lm.step = 1;
    annotate_trip_count(func, lp);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::interp::{run, ArgValue, Scalar};
    use crate::ir::{ElementType, MemRefType, OpBuilder, TRIP_COUNT_ATTR};

    #[test]
    fn test_normalize_strided_loop() {
        // for i in 3..20 step 4 { A[i] = i }
        let mut func = Function::new("f", vec![IrType::MemRef(MemRefType::new(vec![20], ElementType::Index))]);
        let a = func.arguments[0];
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(3, 20, 4);
        let l = func.loop_op(lp).unwrap().clone();
        OpBuilder::at_end(&mut func, l.body).store(l.iv, a, AffineMap::identity(1), vec![l.iv]);

        let args = || vec![ArgValue::Buffer(vec![Scalar::Int(0); 20])];
        let before = run(&func, args()).unwrap();
        let result = LoopNormalize::new().run_on_function(&mut func).unwrap();
        assert_eq!(result.stat("loops_normalized"), 1);

        let nl = func.loop_op(lp).unwrap();
        assert_eq!(nl.lower.as_constant(), Some(0));
        assert_eq!(nl.upper.as_constant(), Some(5));
        assert_eq!(nl.step, 1);
        assert_eq!(func.op(lp).attr_int(TRIP_COUNT_ATTR), Some(5));
        let after = run(&func, args()).unwrap();
        assert_eq!(before.argument_trace(), after.argument_trace());

        assert!(!LoopNormalize::new().run_on_function(&mut func).unwrap().modified);
    }

    #[test]
    fn test_single_iteration_promoted() {
        let mut func = Function::new("f", vec![]);
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(7, 8, 1);
        let l = func.loop_op(lp).unwrap().clone();
        OpBuilder::at_end(&mut func, l.body).call("g", vec![l.iv]);
        let result = LoopNormalize::new().run_on_function(&mut func).unwrap();
        assert_eq!(result.stat("loops_promoted"), 1);
        assert!(func.loops().is_empty());
    }
}
