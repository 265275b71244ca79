//! Loop Utilities
//!
//! Shared loop analysis and surgery: trip counts (constant and symbolic),
//! band discovery, iteration-domain constraints and single-iteration
//! promotion.

use super::value_map::{unify_operands, AffineValueMap};
use crate::affine::{AffineExpr, AffineMap, FlatAffineConstraints, NotAffine, VarKind};
use crate::ir::{AffineBound, Attribute, Function, OpBuilder, OpId, ValueId, TRIP_COUNT_ATTR};
use log::trace;

/// Statically known trip count.
///
/// Every pair of upper and lower bound results must differ by a constant
/// (after composing both maps over a shared operand list); the trip count
/// is then `ceil(min(ub_i - lb_j) / step)`, clamped at zero.
pub fn constant_trip_count(func: &Function, loop_op: OpId) -> Option<u64> {
    let l = func.loop_op(loop_op)?;
    let (exprs, _) = unify_operands(&[
        (&l.lower.map, l.lower.operands.as_slice()),
        (&l.upper.map, l.upper.operands.as_slice()),
    ]);
    let (lowers, uppers) = (&exprs[0], &exprs[1]);
    if lowers.is_empty() || uppers.is_empty() {
        return None;
    }
    let mut min_diff: Option<i64> = None;
    for ub in uppers {
        for lb in lowers {
            let diff = (ub.clone() - lb.clone()).simplify().as_constant()?;
            min_diff = Some(min_diff.map_or(diff, |m| m.min(diff)));
        }
    }
    let diff = min_diff?;
    if diff <= 0 {
        return Some(0);
    }
    Some(crate::affine::expr::ceil_div(diff, l.step) as u64)
}

/// Symbolic trip count `(ub - lb) ceildiv step` for single-result bounds.
pub fn trip_count_map(func: &Function, loop_op: OpId) -> Option<AffineValueMap> {
    let l = func.loop_op(loop_op)?;
    if l.lower.map.num_results() != 1 || l.upper.map.num_results() != 1 {
        return None;
    }
    let (exprs, shared) = unify_operands(&[
        (&l.lower.map, l.lower.operands.as_slice()),
        (&l.upper.map, l.upper.operands.as_slice()),
    ]);
    let diff = exprs[1][0].clone() - exprs[0][0].clone();
    let tc = diff.ceil_div(AffineExpr::Constant(l.step)).simplify();
    Some(AffineValueMap::new(AffineMap::new(shared.len() as u32, 0, vec![tc]), shared))
}

/// Upper bound covering the largest multiple of `factor` iterations:
/// `lb + (tc - tc mod factor) * step`. Requires a single-result lower bound;
/// without a constant trip count the upper bound must be single-result too.
pub fn upper_bound_for_multiple(func: &Function, loop_op: OpId, factor: u64) -> Option<AffineBound> {
    let l = func.loop_op(loop_op)?;
    if l.lower.map.num_results() != 1 {
        return None;
    }
    if let Some(tc) = constant_trip_count(func, loop_op) {
        let span = (tc - tc % factor) as i64 * l.step;
        let result = (l.lower.map.results[0].clone() + span).simplify();
        return Some(AffineBound {
            map: AffineMap::new(l.lower.map.num_dims, l.lower.map.num_symbols, vec![result]),
            operands: l.lower.operands.clone(),
        });
    }
    let tc = trip_count_map(func, loop_op)?;
    let (exprs, shared) = unify_operands(&[
        (&l.lower.map, l.lower.operands.as_slice()),
        (&tc.map, tc.operands.as_slice()),
    ]);
    let f = factor as i64;
    let multiple = exprs[1][0].clone().floor_div(AffineExpr::Constant(f)) * (f * l.step);
    let result = (exprs[0][0].clone() + multiple).simplify();
    Some(AffineBound {
        map: AffineMap::new(shared.len() as u32, 0, vec![result]),
        operands: shared,
    })
}

/// Lower bound of the cleanup loop that follows a main loop ending at
/// `main_upper`. With a symbolic trip count `main_upper` drops below the
/// original lower bound when the range is empty, so the bound becomes
/// `max(lb, main_upper)`.
pub fn cleanup_lower_bound(func: &Function, loop_op: OpId, main_upper: &AffineBound) -> Option<AffineBound> {
    let l = func.loop_op(loop_op)?;
    if constant_trip_count(func, loop_op).is_some() {
        return Some(main_upper.clone());
    }
    let (exprs, shared) = unify_operands(&[
        (&l.lower.map, l.lower.operands.as_slice()),
        (&main_upper.map, main_upper.operands.as_slice()),
    ]);
    let results: Vec<AffineExpr> = exprs.into_iter().flatten().map(|e| e.simplify()).collect();
    Some(AffineBound {
        map: AffineMap::new(shared.len() as u32, 0, results),
        operands: shared,
    })
}

/// Largest divisor of `n` that does not exceed `max`.
pub fn largest_divisor_at_most(n: u64, max: u64) -> u64 {
    (1..=max.min(n).max(1)).rev().find(|d| n % d == 0).unwrap_or(1)
}

/// Loops of the perfect nest rooted at `root`, outermost first: each loop's
/// body holds exactly the next loop.
pub fn perfect_band(func: &Function, root: OpId) -> Vec<OpId> {
    let mut band = vec![root];
    let mut cur = root;
    while let Some(l) = func.loop_op(cur) {
        match func.block(l.body).ops.as_slice() {
            [only] if func.is_loop(*only) => {
                band.push(*only);
                cur = *only;
            }
            _ => break,
        }
    }
    band
}

/// Loops with no enclosing loop, in program order.
pub fn band_roots(func: &Function) -> Vec<OpId> {
    func.loops()
        .into_iter()
        .filter(|&l| func.enclosing_loops(l).is_empty())
        .collect()
}

/// Loops with no nested loop, in program order.
pub fn innermost_loops(func: &Function) -> Vec<OpId> {
    func.loops()
        .into_iter()
        .filter(|&l| !has_nested_loops(func, l))
        .collect()
}

pub fn has_nested_loops(func: &Function, loop_op: OpId) -> bool {
    func.walk_nested(loop_op).into_iter().any(|op| func.is_loop(op))
}

/// Number of loops enclosing `op`.
pub fn loop_depth(func: &Function, op: OpId) -> usize {
    func.enclosing_loops(op).len()
}

/// Whether every operand of `bound` is available outside `loop_op`.
pub fn bound_is_invariant(func: &Function, bound: &AffineBound, loop_op: OpId) -> bool {
    bound.operands.iter().all(|&v| func.is_defined_outside(v, loop_op))
}

/// Record a known trip count on the loop.
pub fn annotate_trip_count(func: &mut Function, loop_op: OpId) {
    if let Some(tc) = constant_trip_count(func, loop_op) {
        func.set_attr(loop_op, TRIP_COUNT_ATTR, Attribute::Int(tc as i64));
    }
}

/// Value of a single-result bound, materialized before `anchor`.
pub fn materialize_bound(func: &mut Function, anchor: OpId, bound: &AffineBound) -> ValueId {
    let mut b = OpBuilder::before(func, anchor);
    match bound.as_constant() {
        Some(c) => b.constant_index(c),
        None => b.apply(bound.map.clone(), bound.operands.clone()),
    }
}

/// Replace a loop that runs exactly once by its body. Returns whether the
/// loop was promoted.
pub fn promote_if_single_iteration(func: &mut Function, loop_op: OpId) -> bool {
    if constant_trip_count(func, loop_op) != Some(1) {
        return false;
    }
    let Some(l) = func.loop_op(loop_op).cloned() else {
        return false;
    };
    if l.lower.map.num_results() != 1 {
        return false;
    }
    trace!("promoting single-iteration loop {}", loop_op);
    if func.has_uses(l.iv) {
        let iv = materialize_bound(func, loop_op, &l.lower);
        func.replace_uses_in_block(l.body, l.iv, iv);
    }
    for op in func.block(l.body).ops.clone() {
        func.move_op_before(op, loop_op);
    }
    func.erase_op(loop_op);
    true
}

/// Add the iteration domain of `loop_op` to `cst`: `iv >= lb_j`,
/// `iv <= ub_i - 1` and, for non-unit steps with a single lower bound,
/// `iv == lb + step * q` with a fresh local `q`. Returns the position of
/// the induction variable.
pub fn add_loop_domain(
    cst: &mut FlatAffineConstraints,
    func: &Function,
    loop_op: OpId,
    resolve: &mut dyn FnMut(&mut FlatAffineConstraints, ValueId, bool) -> usize,
) -> Result<usize, NotAffine> {
    let l = func.loop_op(loop_op).ok_or(NotAffine)?;
    let iv_pos = resolve(cst, l.iv, true);

    let lower = AffineValueMap::compose(func, &l.lower.map, &l.lower.operands)?;
    let lower_rows = lower.add_to_constraints(cst, resolve)?;
    let upper = AffineValueMap::compose(func, &l.upper.map, &l.upper.operands)?;
    let upper_rows = upper.add_to_constraints(cst, resolve)?;

    let n = cst.num_vars();
    for row in &lower_rows {
        let mut ineq = cst.pad_row(row.iter().map(|c| -c).collect(), row.len() - 1);
        ineq[iv_pos] += 1;
        cst.add_inequality(ineq);
    }
    for row in &upper_rows {
        let mut ineq = cst.pad_row(row.clone(), row.len() - 1);
        ineq[iv_pos] -= 1;
        ineq[n] -= 1;
        cst.add_inequality(ineq);
    }
    if l.step > 1 && lower_rows.len() == 1 {
        let lb = cst.pad_row(lower_rows[0].clone(), lower_rows[0].len() - 1);
        let q = cst.append_var(VarKind::Local, None);
        let mut eq: Vec<i64> = lb.iter().map(|c| -c).collect();
        eq.insert(q, 0);
        eq[iv_pos] += 1;
        eq[q] -= l.step;
        cst.add_equality(eq);
        cst.add_lower_bound(q, 0);
    }
    Ok(iv_pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::value_map::resolve_by_id;
    use crate::ir::IrType;

    #[test]
    fn test_constant_trip_count() {
        let mut func = Function::new("f", vec![]);
        let body = func.body;
        let mut b = OpBuilder::at_end(&mut func, body);
        let l1 = b.constant_for(0, 10, 1);
        let l2 = b.constant_for(3, 20, 4);
        let l3 = b.constant_for(5, 5, 1);
        assert_eq!(constant_trip_count(&func, l1), Some(10));
        assert_eq!(constant_trip_count(&func, l2), Some(5));
        assert_eq!(constant_trip_count(&func, l3), Some(0));
    }

    #[test]
    fn test_symbolic_trip_count() {
        let mut func = Function::new("f", vec![IrType::index()]);
        let n = func.arguments[0];
        let body = func.body;
        let ub = AffineBound {
            map: AffineMap::new(0, 1, vec![AffineExpr::symbol(0)]),
            operands: vec![n],
        };
        let lp = OpBuilder::at_end(&mut func, body).for_loop(AffineBound::constant(0), ub.clone(), 2);
        assert_eq!(constant_trip_count(&func, lp), None);
        let tc = trip_count_map(&func, lp).unwrap();
        assert_eq!(tc.operands, vec![n]);
        assert_eq!(tc.map.eval(&[7], &[]), Some(vec![4]));

        // Same operand in both bounds: the difference is constant.
        let shifted = AffineBound {
            map: AffineMap::new(0, 1, vec![AffineExpr::symbol(0) + 6]),
            operands: vec![n],
        };
        let lp2 = OpBuilder::at_end(&mut func, body).for_loop(ub, shifted, 1);
        assert_eq!(constant_trip_count(&func, lp2), Some(6));
    }

    #[test]
    fn test_upper_bound_for_multiple() {
        let mut func = Function::new("f", vec![]);
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(0, 10, 1);
        let ub = upper_bound_for_multiple(&func, lp, 4).unwrap();
        assert_eq!(ub.as_constant(), Some(8));
    }

    #[test]
    fn test_cleanup_lower_bound_clamps_empty_range() {
        let mut func = Function::new("f", vec![IrType::index()]);
        let n = func.arguments[0];
        let body = func.body;
        let ub = AffineBound {
            map: AffineMap::new(0, 1, vec![AffineExpr::symbol(0)]),
            operands: vec![n],
        };
        let lp = OpBuilder::at_end(&mut func, body).for_loop(AffineBound::constant(0), ub, 1);
        let main_upper = upper_bound_for_multiple(&func, lp, 4).unwrap();
        let lower = cleanup_lower_bound(&func, lp, &main_upper).unwrap();
        assert_eq!(lower.map.num_results(), 2);
        let max_at = |v: i64| lower.map.eval(&[v], &[]).unwrap().into_iter().max().unwrap();
        assert_eq!(max_at(-3), 0);
        assert_eq!(max_at(0), 0);
        assert_eq!(max_at(13), 12);

        let constant = OpBuilder::at_end(&mut func, body).constant_for(0, 10, 1);
        let main_upper = upper_bound_for_multiple(&func, constant, 4).unwrap();
        let lower = cleanup_lower_bound(&func, constant, &main_upper).unwrap();
        assert_eq!(lower.as_constant(), Some(8));
    }

    #[test]
    fn test_largest_divisor() {
        assert_eq!(largest_divisor_at_most(12, 5), 4);
        assert_eq!(largest_divisor_at_most(7, 4), 1);
        assert_eq!(largest_divisor_at_most(8, 16), 8);
    }

    #[test]
    fn test_promote_single_iteration() {
        let mut func = Function::new("f", vec![]);
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(3, 4, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, l.body);
        let one = b.constant_index(1);
        let sum = b.add(l.iv, one);
        assert!(promote_if_single_iteration(&mut func, lp));
        assert!(func.loops().is_empty());
        assert_eq!(func.block(body).ops.len(), 3);
        let add_op = func.defining_op(sum).unwrap();
        let lhs = func.op(add_op).kind.operands()[0];
        let def = func.defining_op(lhs).unwrap();
        assert_eq!(
            func.op(def).kind,
            crate::ir::OpKind::Constant(crate::ir::Literal::Int(3))
        );
    }

    #[test]
    fn test_loop_domain() {
        let mut func = Function::new("f", vec![]);
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(2, 11, 3);
        let mut cst = FlatAffineConstraints::new();
        let pos = add_loop_domain(&mut cst, &func, lp, &mut resolve_by_id).unwrap();
        assert_eq!(cst.num_locals(), 1);
        assert_eq!(cst.equalities().len(), 1);
        assert_eq!(cst.constant_lower_bound(pos), Some(2));
        assert_eq!(cst.constant_upper_bound(pos), Some(10));
    }
}
