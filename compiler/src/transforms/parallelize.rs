//! Parallelism Detection
//!
//! Marks a loop parallel when no dependence between two accesses nested in
//! it is carried at its depth. Loops are visited innermost first and judged
//! independently; an access pair that cannot be analyzed keeps the loop
//! sequential.

use super::{verify, AffinePass, OptimizationResult, PassError};
use crate::analysis::access::collect_accesses;
use crate::analysis::dependence::{check_memref_access_dependence, DependenceResult};
use crate::analysis::loops::loop_depth;
use crate::ir::{Function, OpId, OpKind};
use log::{debug, trace};

#[derive(Debug, Clone, Default)]
pub struct AffineParallelize;

impl AffineParallelize {
    pub fn new() -> Self {
        Self
    }
}

impl AffinePass for AffineParallelize {
    fn name(&self) -> &'static str {
        "affine-parallelize"
    }

    fn run_on_function(&self, func: &mut Function) -> Result<OptimizationResult, PassError> {
        verify(func)?;
        let mut marked = 0;
        for lp in func.loops_post_order() {
            if func.loop_op(lp).is_some_and(|l| l.parallel) {
                continue;
            }
            if is_loop_parallel(func, lp) {
                trace!("marking {} parallel", lp);
                func.loop_op_mut(lp).parallel = true;
                marked += 1;
            }
        }
        let mut result = OptimizationResult::unchanged();
        result.record("loops_parallelized", marked);
        if marked > 0 {
            debug!("marked {} loops parallel in {}", marked, func.name);
        }
        Ok(result)
    }
}

/// Whether iterations of `lp` can run in any order.
pub fn is_loop_parallel(func: &Function, lp: OpId) -> bool {
    let nested = func.walk_nested(lp);
    if nested.iter().any(|&op| {
        matches!(
            func.op(op).kind,
            OpKind::Call { .. } | OpKind::DmaStart { .. } | OpKind::DmaWait { .. }
        )
    }) {
        return false;
    }
    let depth = loop_depth(func, lp) + 1;
    let accesses = collect_accesses(func, Some(lp));
    for src in &accesses {
        for dst in &accesses {
            match check_memref_access_dependence(func, src, dst, depth, false) {
                DependenceResult::NoDependence => {}
                DependenceResult::HasDependence(_) => {
                    trace!("{} carries a dependence {} -> {}", lp, src.op, dst.op);
                    return false;
                }
                DependenceResult::Failure => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::{AffineExpr, AffineMap};
    use crate::ir::{ElementType, IrType, MemRefType, OpBuilder};

    #[test]
    fn test_outer_parallel_inner_sequential() {
        // for i { for j in 1..16 { A[i][j] = A[i][j-1] } }
        let mut func = Function::new(
            "f",
            vec![IrType::MemRef(MemRefType::new(vec![8, 16], ElementType::F32))],
        );
        let a = func.arguments[0];
        let body = func.body;
        let outer = OpBuilder::at_end(&mut func, body).constant_for(0, 8, 1);
        let ob = func.loop_op(outer).unwrap().clone();
        let inner = OpBuilder::at_end(&mut func, ob.body).constant_for(1, 16, 1);
        let il = func.loop_op(inner).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, il.body);
        let prev = AffineMap::new(2, 0, vec![AffineExpr::dim(0), AffineExpr::dim(1) - 1]);
        let v = b.load(a, prev, vec![ob.iv, il.iv]);
        b.store(v, a, AffineMap::identity(2), vec![ob.iv, il.iv]);

        let result = AffineParallelize::new().run_on_function(&mut func).unwrap();
        assert_eq!(result.stat("loops_parallelized"), 1);
        assert!(func.loop_op(outer).unwrap().parallel);
        assert!(!func.loop_op(inner).unwrap().parallel);
    }

    #[test]
    fn test_call_blocks_parallelism() {
        let mut func = Function::new("f", vec![]);
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(0, 8, 1);
        let l = func.loop_op(lp).unwrap().clone();
        OpBuilder::at_end(&mut func, l.body).call("side_effect", vec![l.iv]);
        assert!(!AffineParallelize::new().run_on_function(&mut func).unwrap().modified);
    }
}
