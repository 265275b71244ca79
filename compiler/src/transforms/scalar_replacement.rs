//! Scalar Replacement
//!
//! Replaces loads by values already held in registers:
//!
//! - store-to-load forwarding: a load reads the value of a dominating store
//!   to the same address;
//! - redundant load elimination: a load repeats a dominating load of the
//!   same address;
//!
//! in both cases only when nothing that may write the buffer can run in
//! between, including later iterations of loops entered on the way. Buffers
//! that are then only stored to and freed are removed.

use super::{verify, AffinePass, OptimizationResult, PassError};
use crate::analysis::access::{may_alias, MemRefAccess};
use crate::ir::{Function, OpId, OpKind, ValueId};
use log::{debug, trace};

#[derive(Debug, Clone, Default)]
pub struct AffineScalarReplacement;

impl AffineScalarReplacement {
    pub fn new() -> Self {
        Self
    }
}

impl AffinePass for AffineScalarReplacement {
    fn name(&self) -> &'static str {
        "affine-scalrep"
    }

    fn run_on_function(&self, func: &mut Function) -> Result<OptimizationResult, PassError> {
        verify(func)?;
        let forwarded = forward_stores_to_loads(func);
        let eliminated = eliminate_redundant_loads(func);
        let removed = remove_dead_allocs(func);

        let mut result = OptimizationResult::unchanged();
        result.record("loads_forwarded", forwarded);
        result.record("loads_eliminated", eliminated);
        result.record("allocs_removed", removed);
        if result.modified {
            debug!(
                "scalar replacement in {}: {} forwarded, {} redundant, {} dead buffers",
                func.name, forwarded, eliminated, removed
            );
        }
        Ok(result)
    }
}

fn scalar_accesses(func: &Function, store: bool) -> Vec<OpId> {
    func.walk()
        .into_iter()
        .filter(|&op| match &func.op(op).kind {
            OpKind::Load(_) => !store,
            OpKind::Store { .. } => store,
            _ => false,
        })
        .collect()
}

/// Whether `from` reaches `to` with the same address and nothing writing
/// the buffer in between.
fn reaches(func: &Function, from: OpId, to: &MemRefAccess) -> bool {
    func.is_live(from)
        && func.properly_dominates(from, to.op)
        && MemRefAccess::from_op(func, from).is_some_and(|a| a.is_same_address(to, func))
        && !has_intervening_write(func, from, to.op, to.memref)
}

pub fn forward_stores_to_loads(func: &mut Function) -> usize {
    let stores = scalar_accesses(func, true);
    let mut forwarded = 0;
    for load_op in scalar_accesses(func, false) {
        let Some(load) = MemRefAccess::from_op(func, load_op) else {
            continue;
        };
        let Some(&store) = stores.iter().find(|&&store| reaches(func, store, &load)) else {
            continue;
        };
        let (OpKind::Store { value, .. }, Some(result)) = (&func.op(store).kind, func.op(load_op).result()) else {
            continue;
        };
        let value = *value;
        trace!("forwarding {} to {}", store, load_op);
        func.replace_all_uses_with(result, value);
        func.erase_op(load_op);
        forwarded += 1;
    }
    forwarded
}

pub fn eliminate_redundant_loads(func: &mut Function) -> usize {
    let loads = scalar_accesses(func, false);
    let mut eliminated = 0;
    for (i, &load_op) in loads.iter().enumerate() {
        let Some(load) = MemRefAccess::from_op(func, load_op) else {
            continue;
        };
        let Some(&prev) = loads[..i].iter().find(|&&prev| reaches(func, prev, &load)) else {
            continue;
        };
        let (Some(old), Some(new)) = (func.op(load_op).result(), func.op(prev).result()) else {
            continue;
        };
        trace!("{} repeats {}", load_op, prev);
        func.replace_all_uses_with(old, new);
        func.erase_op(load_op);
        eliminated += 1;
    }
    eliminated
}

/// Remove buffers whose only uses are stores into them and their dealloc.
pub fn remove_dead_allocs(func: &mut Function) -> usize {
    let allocs: Vec<(OpId, ValueId)> = func
        .walk()
        .into_iter()
        .filter(|&op| matches!(func.op(op).kind, OpKind::Alloc { .. }))
        .filter_map(|op| func.op(op).result().map(|v| (op, v)))
        .collect();
    let mut removed = 0;
    for (alloc, memref) in allocs {
        let users = func.uses(memref);
        let dead = users.iter().all(|&user| match &func.op(user).kind {
            OpKind::Store { value, access } | OpKind::VectorStore { value, access } => {
                access.memref == memref && *value != memref
            }
            OpKind::Dealloc { .. } => true,
            _ => false,
        });
        if !dead {
            continue;
        }
        trace!("removing dead buffer {}", memref);
        for user in users {
            func.erase_op(user);
        }
        func.erase_op(alloc);
        removed += 1;
    }
    removed
}

/// Whether something that may write `memref` can execute after `from` and
/// before `to`, where `from` properly dominates `to`. Everything nested in
/// the ancestor of `to` that sits in `from`'s block counts: when that
/// ancestor is a loop, its whole body runs again before later iterations
/// reach `to`.
fn has_intervening_write(func: &Function, from: OpId, to: OpId, memref: ValueId) -> bool {
    let block = func.op(from).parent;
    let mut ancestor = to;
    while func.op(ancestor).parent != block {
        match func.parent_op(ancestor) {
            Some(p) => ancestor = p,
            None => return true,
        }
    }

    let ops = &func.block(block).ops;
    let start = func.position_in_block(from) + 1;
    let end = func.position_in_block(ancestor);
    let mut between: Vec<OpId> = Vec::new();
    for &op in &ops[start..end] {
        between.push(op);
        between.extend(func.walk_nested(op));
    }
    if ancestor != to {
        between.extend(func.walk_nested(ancestor));
    }
    between
        .into_iter()
        .filter(|&op| op != to && op != from)
        .any(|op| may_write(func, op, memref))
}

fn may_write(func: &Function, op: OpId, memref: ValueId) -> bool {
    match &func.op(op).kind {
        OpKind::Store { access, .. } | OpKind::VectorStore { access, .. } => may_alias(func, access.memref, memref),
        OpKind::DmaStart { dst, .. } => may_alias(func, dst.memref, memref),
        OpKind::Dealloc { memref: m } => may_alias(func, *m, memref),
        OpKind::Call { args, .. } => args.iter().any(|&a| may_alias(func, a, memref)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::AffineMap;
    use crate::ir::interp::{run, ArgValue, Scalar};
    use crate::ir::{ElementType, IrType, MemRefType, OpBuilder};

    fn memref(n: i64) -> IrType {
        IrType::MemRef(MemRefType::new(vec![n], ElementType::I64))
    }

    fn count_loads(func: &Function) -> usize {
        func.walk().into_iter().filter(|&op| func.op(op).kind.is_load()).count()
    }

    #[test]
    fn test_forward_in_same_iteration() {
        // for i { A[i] = B[i] * 2; C[i] = A[i] }
        let mut func = Function::new("f", vec![memref(8), memref(8), memref(8)]);
        let (a, b_arg, c) = (func.arguments[0], func.arguments[1], func.arguments[2]);
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(0, 8, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, l.body);
        let x = b.load(b_arg, AffineMap::identity(1), vec![l.iv]);
        let two = b.constant_int(2, ElementType::I64);
        let y = b.mul(x, two);
        b.store(y, a, AffineMap::identity(1), vec![l.iv]);
        let z = b.load(a, AffineMap::identity(1), vec![l.iv]);
        b.store(z, c, AffineMap::identity(1), vec![l.iv]);

        let args = || {
            let data: Vec<Scalar> = (0..8).map(Scalar::Int).collect();
            vec![
                ArgValue::Buffer(vec![Scalar::Int(0); 8]),
                ArgValue::Buffer(data),
                ArgValue::Buffer(vec![Scalar::Int(0); 8]),
            ]
        };
        let before = run(&func, args()).unwrap();
        let result = AffineScalarReplacement::new().run_on_function(&mut func).unwrap();
        assert_eq!(result.stat("loads_forwarded"), 1);
        assert_eq!(count_loads(&func), 1);
        let after = run(&func, args()).unwrap();
        assert_eq!(before.buffers, after.buffers);
    }

    #[test]
    fn test_loop_back_edge_blocks_forwarding() {
        // A[0] = 0; for i { v = A[0]; A[0] = v + 1 }
        let mut func = Function::new("f", vec![memref(1)]);
        let a = func.arguments[0];
        let body = func.body;
        let mut b = OpBuilder::at_end(&mut func, body);
        let zero_idx = b.constant_index(0);
        let zero = b.constant_int(0, ElementType::I64);
        b.store(zero, a, AffineMap::identity(1), vec![zero_idx]);
        let lp = b.constant_for(0, 4, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, l.body);
        let v = b.load(a, AffineMap::constant(0), vec![]);
        let one = b.constant_int(1, ElementType::I64);
        let w = b.add(v, one);
        b.store(w, a, AffineMap::constant(0), vec![]);

        let result = AffineScalarReplacement::new().run_on_function(&mut func).unwrap();
        assert_eq!(result.stat("loads_forwarded"), 0);
        assert_eq!(count_loads(&func), 1);
    }

    #[test]
    fn test_redundant_load_and_call() {
        // x = A[1]; y = A[1]; call(A); z = A[1]
        let mut func = Function::new("f", vec![memref(4)]);
        let a = func.arguments[0];
        let body = func.body;
        let mut b = OpBuilder::at_end(&mut func, body);
        let at_one = AffineMap::constant(1);
        let x = b.load(a, at_one.clone(), vec![]);
        let y = b.load(a, at_one.clone(), vec![]);
        b.call("clobber", vec![a]);
        let z = b.load(a, at_one, vec![]);
        b.ret(vec![x, y, z]);

        let result = AffineScalarReplacement::new().run_on_function(&mut func).unwrap();
        assert_eq!(result.stat("loads_eliminated"), 1);
        assert_eq!(count_loads(&func), 2);
    }

    #[test]
    fn test_dead_alloc_removed() {
        let mut func = Function::new("f", vec![]);
        let body = func.body;
        let mut b = OpBuilder::at_end(&mut func, body);
        let tmp = b.alloc(MemRefType::new(vec![4], ElementType::I64));
        let lp = b.constant_for(0, 4, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let mut inner = OpBuilder::at_end(&mut func, l.body);
        let one = inner.constant_int(1, ElementType::I64);
        inner.store(one, tmp, AffineMap::identity(1), vec![l.iv]);
        OpBuilder::at_end(&mut func, body).dealloc(tmp);

        let result = AffineScalarReplacement::new().run_on_function(&mut func).unwrap();
        assert_eq!(result.stat("allocs_removed"), 1);
        assert!(func.block(l.body).ops.iter().all(|&op| !func.op(op).kind.is_store()));
        assert!(!func
            .walk()
            .into_iter()
            .any(|op| matches!(func.op(op).kind, OpKind::Alloc { .. } | OpKind::Dealloc { .. })));
    }
}
