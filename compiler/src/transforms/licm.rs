//! Loop Invariant Code Motion
//!
//! Hoists side-effect free operations whose operands are all available
//! outside the loop. Loops are visited innermost first and each loop is
//! iterated to a fixed point, so an operation can climb several levels in
//! one run.

use super::{verify, AffinePass, OptimizationResult, PassError};
use crate::analysis::access::may_alias;
use crate::ir::{BinaryOp, Function, OpId, OpKind, ValueId};
use log::{debug, trace};

#[derive(Debug, Clone, Default)]
pub struct LoopInvariantCodeMotion;

impl LoopInvariantCodeMotion {
    pub fn new() -> Self {
        Self
    }
}

impl AffinePass for LoopInvariantCodeMotion {
    fn name(&self) -> &'static str {
        "affine-loop-invariant-code-motion"
    }

    fn run_on_function(&self, func: &mut Function) -> Result<OptimizationResult, PassError> {
        verify(func)?;
        let mut hoisted = 0;
        for lp in func.loops_post_order() {
            hoisted += hoist_from_loop(func, lp);
        }
        let mut result = OptimizationResult::unchanged();
        result.record("ops_hoisted", hoisted);
        if hoisted > 0 {
            debug!("hoisted {} operations in {}", hoisted, func.name);
        }
        Ok(result)
    }
}

fn hoist_from_loop(func: &mut Function, lp: OpId) -> usize {
    let Some(body) = func.loop_op(lp).map(|l| l.body) else {
        return 0;
    };
    let mut hoisted = 0;
    loop {
        let mut changed = false;
        for op in func.block(body).ops.clone() {
            if is_invariant(func, op, lp) {
                trace!("hoisting {} out of {}", op, lp);
                func.move_op_before(op, lp);
                hoisted += 1;
                changed = true;
            }
        }
        if !changed {
            return hoisted;
        }
    }
}

fn is_invariant(func: &Function, op: OpId, lp: OpId) -> bool {
    let kind = &func.op(op).kind;
    let movable = match kind {
        OpKind::Constant(_) | OpKind::Apply { .. } | OpKind::Broadcast { .. } => true,
        OpKind::Binary { op: bin, lhs, .. } => {
            !(matches!(bin, BinaryOp::Div | BinaryOp::Rem) && !func.value_type(*lhs).element().is_float())
        }
        OpKind::Load(a) | OpKind::VectorLoad { access: a, .. } => !is_modified_in(func, a.memref, lp),
        _ => false,
    };
    movable && kind.operands().into_iter().all(|v| func.is_defined_outside(v, lp))
}

/// Whether anything nested in `lp` may write, transfer, free or escape
/// `memref`.
fn is_modified_in(func: &Function, memref: ValueId, lp: OpId) -> bool {
    func.walk_nested(lp).into_iter().any(|op| match &func.op(op).kind {
        OpKind::Store { access, .. } | OpKind::VectorStore { access, .. } => may_alias(func, access.memref, memref),
        OpKind::DmaStart { src, dst, .. } => {
            may_alias(func, src.memref, memref) || may_alias(func, dst.memref, memref)
        }
        OpKind::Dealloc { memref: m } => may_alias(func, *m, memref),
        OpKind::Call { args, .. } => args.iter().any(|&a| may_alias(func, a, memref)),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::AffineMap;
    use crate::ir::{ElementType, IrType, MemRefType, OpBuilder};

    fn memref() -> IrType {
        IrType::MemRef(MemRefType::new(vec![16], ElementType::F32))
    }

    #[test]
    fn test_hoists_through_two_levels() {
        // for i { for j { c = 2.0; x = B[0]; y = x * c; A[j] = y } }
        let mut func = Function::new("f", vec![memref(), memref()]);
        let (a, b_arg) = (func.arguments[0], func.arguments[1]);
        let body = func.body;
        let outer = OpBuilder::at_end(&mut func, body).constant_for(0, 4, 1);
        let ob = func.loop_op(outer).unwrap().body;
        let inner = OpBuilder::at_end(&mut func, ob).constant_for(0, 16, 1);
        let il = func.loop_op(inner).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, il.body);
        let zero = b.constant_index(0);
        let c = b.constant_float(2.0, ElementType::F32);
        let x = b.load(b_arg, AffineMap::identity(1), vec![zero]);
        let y = b.mul(x, c);
        b.store(y, a, AffineMap::identity(1), vec![il.iv]);

        let result = LoopInvariantCodeMotion::new().run_on_function(&mut func).unwrap();
        assert!(result.modified);
        // Everything but the store ends up in the function body.
        assert_eq!(func.block(il.body).ops.len(), 1);
        assert_eq!(func.block(ob).ops.len(), 1);
        assert_eq!(func.block(body).ops.len(), 5);
    }

    #[test]
    fn test_load_of_written_memref_stays() {
        let mut func = Function::new("f", vec![memref()]);
        let a = func.arguments[0];
        let body = func.body;
        let zero = OpBuilder::at_end(&mut func, body).constant_index(0);
        let lp = OpBuilder::at_end(&mut func, body).constant_for(0, 16, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, l.body);
        let x = b.load(a, AffineMap::identity(1), vec![zero]);
        b.store(x, a, AffineMap::identity(1), vec![l.iv]);

        let result = LoopInvariantCodeMotion::new().run_on_function(&mut func).unwrap();
        assert!(!result.modified);
        assert_eq!(func.block(l.body).ops.len(), 2);
    }

    #[test]
    fn test_integer_division_not_hoisted() {
        let mut func = Function::new("f", vec![IrType::index(), IrType::index()]);
        let (n, m) = (func.arguments[0], func.arguments[1]);
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(0, 4, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let q = OpBuilder::at_end(&mut func, l.body).binary(BinaryOp::Div, n, m);
        OpBuilder::at_end(&mut func, l.body).call("use", vec![q]);
        assert!(!LoopInvariantCodeMotion::new().run_on_function(&mut func).unwrap().modified);
    }
}
