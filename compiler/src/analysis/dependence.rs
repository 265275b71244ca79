//! Dependence Analysis
//!
//! Exact (up to Fourier-Motzkin projection) dependence testing between two
//! affine accesses. The dependence system holds one copy of the source's
//! enclosing induction variables, one copy of the destination's, the shared
//! symbols, equal-address constraints and the lexicographic ordering that
//! selects the loop depth carrying the dependence.

use super::access::{collect_accesses, may_alias, MemRefAccess};
use super::loops::add_loop_domain;
use crate::affine::{FlatAffineConstraints, NotAffine, VarKind};
use crate::ir::{BlockId, Function, OpId, ValueId};
use fxhash::FxHashMap;
use log::trace;
use serde::{Deserialize, Serialize};

/// Dependence direction at one loop level, from source to destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// < (forward)
    Lt,
    /// = (same iteration)
    Eq,
    /// > (backward)
    Gt,
    /// <=
    Le,
    /// >=
    Ge,
    /// Unknown
    Star,
}

/// Range of `dst_iv - src_iv` for one common loop; `None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependenceComponent {
    pub loop_op: OpId,
    pub lb: Option<i64>,
    pub ub: Option<i64>,
}

impl DependenceComponent {
    pub fn direction(&self) -> Direction {
        match (self.lb, self.ub) {
            (Some(0), Some(0)) => Direction::Eq,
            (Some(lb), _) if lb > 0 => Direction::Lt,
            (_, Some(ub)) if ub < 0 => Direction::Gt,
            (Some(lb), _) if lb >= 0 => Direction::Le,
            (_, Some(ub)) if ub <= 0 => Direction::Ge,
            _ => Direction::Star,
        }
    }

    pub fn is_non_negative(&self) -> bool {
        self.lb.is_some_and(|lb| lb >= 0)
    }

    pub fn is_zero(&self) -> bool {
        self.lb == Some(0) && self.ub == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependenceResult {
    NoDependence,
    /// Components for each loop common to both accesses (empty when not
    /// requested).
    HasDependence(Vec<DependenceComponent>),
    /// The accesses could not be analyzed; assume they conflict.
    Failure,
}

impl DependenceResult {
    pub fn has_dependence(&self) -> bool {
        !matches!(self, DependenceResult::NoDependence)
    }
}

/// Number of loops enclosing both operations.
pub fn num_common_loops(func: &Function, a: OpId, b: OpId) -> usize {
    let la = func.enclosing_loops(a);
    let lb = func.enclosing_loops(b);
    la.iter().zip(&lb).take_while(|(x, y)| x == y).count()
}

/// Whether `a` comes before `b` in program order within the innermost block
/// holding ancestors of both.
pub fn precedes(func: &Function, a: OpId, b: OpId) -> bool {
    let mut chain: FxHashMap<BlockId, OpId> = FxHashMap::default();
    let mut cur = Some(a);
    while let Some(op) = cur {
        chain.insert(func.op(op).parent, op);
        cur = func.parent_op(op);
    }
    let mut cur = Some(b);
    while let Some(op) = cur {
        if let Some(&ancestor) = chain.get(&func.op(op).parent) {
            return ancestor != op && func.position_in_block(ancestor) < func.position_in_block(op);
        }
        cur = func.parent_op(op);
    }
    false
}

/// Test whether `dst` depends on `src` with the dependence carried at
/// `loop_depth` (1-based): the induction variables of the outer
/// `loop_depth - 1` common loops are equal and the destination runs in a
/// later iteration of loop `loop_depth`. With `loop_depth` one past the
/// common loops, the dependence is loop independent and requires `src` to
/// precede `dst`.
pub fn check_memref_access_dependence(
    func: &Function,
    src: &MemRefAccess,
    dst: &MemRefAccess,
    loop_depth: usize,
    with_components: bool,
) -> DependenceResult {
    if !may_alias(func, src.memref, dst.memref) {
        return DependenceResult::NoDependence;
    }
    if !src.is_store && !dst.is_store {
        return DependenceResult::NoDependence;
    }
    let common = num_common_loops(func, src.op, dst.op);
    if loop_depth == 0 || loop_depth > common + 1 {
        return DependenceResult::NoDependence;
    }
    if loop_depth == common + 1 && !precedes(func, src.op, dst.op) {
        return DependenceResult::NoDependence;
    }
    match build_dependence_system(func, src, dst, loop_depth, common) {
        Ok(None) => DependenceResult::NoDependence,
        Ok(Some((cst, src_ivs, dst_ivs))) => {
            if !with_components {
                return DependenceResult::HasDependence(Vec::new());
            }
            let loops = func.enclosing_loops(src.op);
            let components = (0..common)
                .map(|i| distance_bounds(&cst, src_ivs[i], dst_ivs[i], loops[i]))
                .collect();
            DependenceResult::HasDependence(components)
        }
        Err(NotAffine) => {
            trace!("dependence {} -> {} not analyzable", src.op, dst.op);
            DependenceResult::Failure
        }
    }
}

type DependenceSystem = (FlatAffineConstraints, Vec<usize>, Vec<usize>);

fn build_dependence_system(
    func: &Function,
    src: &MemRefAccess,
    dst: &MemRefAccess,
    loop_depth: usize,
    common: usize,
) -> Result<Option<DependenceSystem>, NotAffine> {
    let src_loops = func.enclosing_loops(src.op);
    let dst_loops = func.enclosing_loops(dst.op);
    let mut cst = FlatAffineConstraints::new();

    // Source induction variables carry their value; destination copies are
    // anonymous columns tracked here.
    let mut src_resolve = |cst: &mut FlatAffineConstraints, v: ValueId, _is_dim: bool| {
        cst.find_var(v).unwrap_or_else(|| {
            let kind = if func.is_induction_var(v) { VarKind::Dim } else { VarKind::Symbol };
            cst.append_var(kind, Some(v))
        })
    };
    let dst_iv_set: Vec<ValueId> = dst_loops
        .iter()
        .filter_map(|&l| func.loop_op(l).map(|l| l.iv))
        .collect();
    let mut dst_copies: FxHashMap<ValueId, usize> = FxHashMap::default();
    let mut dst_resolve = |cst: &mut FlatAffineConstraints, v: ValueId, _is_dim: bool| {
        if dst_iv_set.contains(&v) {
            *dst_copies
                .entry(v)
                .or_insert_with(|| cst.append_var(VarKind::Dim, None))
        } else {
            cst.find_var(v)
                .unwrap_or_else(|| cst.append_var(VarKind::Symbol, Some(v)))
        }
    };

    let mut src_ivs = Vec::with_capacity(src_loops.len());
    for &l in &src_loops {
        src_ivs.push(add_loop_domain(&mut cst, func, l, &mut src_resolve)?);
    }
    let mut dst_ivs = Vec::with_capacity(dst_loops.len());
    for &l in &dst_loops {
        dst_ivs.push(add_loop_domain(&mut cst, func, l, &mut dst_resolve)?);
    }

    let src_rows = src.value_map(func)?.add_to_constraints(&mut cst, &mut src_resolve)?;
    let dst_rows = dst.value_map(func)?.add_to_constraints(&mut cst, &mut dst_resolve)?;
    let n = cst.num_vars();
    let pad = |cst: &FlatAffineConstraints, row: &Vec<i64>| cst.pad_row(row.clone(), row.len() - 1);

    for k in 0..src.rank().min(dst.rank()) {
        let s = pad(&cst, &src_rows[k]);
        let d = pad(&cst, &dst_rows[k]);
        let (es, ed) = (src.extent(k), dst.extent(k));
        if es == 1 && ed == 1 {
            cst.add_equality(s.iter().zip(&d).map(|(a, b)| a - b).collect());
        } else {
            // Intervals [s, s + es - 1] and [d, d + ed - 1] overlap.
            let mut a: Vec<i64> = s.iter().zip(&d).map(|(x, y)| x - y).collect();
            a[n] += es - 1;
            let mut b: Vec<i64> = d.iter().zip(&s).map(|(x, y)| x - y).collect();
            b[n] += ed - 1;
            cst.add_inequality(a);
            cst.add_inequality(b);
        }
    }

    let eq_levels = (loop_depth - 1).min(common);
    for i in 0..eq_levels {
        let mut row = vec![0; n + 1];
        row[dst_ivs[i]] = 1;
        row[src_ivs[i]] = -1;
        cst.add_equality(row);
    }
    if loop_depth <= common {
        let i = loop_depth - 1;
        let mut row = vec![0; n + 1];
        row[dst_ivs[i]] = 1;
        row[src_ivs[i]] = -1;
        row[n] = -1;
        cst.add_inequality(row);
    }

    if cst.is_empty() {
        return Ok(None);
    }
    Ok(Some((cst, src_ivs, dst_ivs)))
}

fn distance_bounds(cst: &FlatAffineConstraints, src_iv: usize, dst_iv: usize, loop_op: OpId) -> DependenceComponent {
    let mut cst = cst.clone();
    let delta = cst.append_var(VarKind::Dim, None);
    let mut row = vec![0; cst.num_vars() + 1];
    row[delta] = 1;
    row[dst_iv] = -1;
    row[src_iv] = 1;
    cst.add_equality(row);
    DependenceComponent {
        loop_op,
        lb: cst.constant_lower_bound(delta),
        ub: cst.constant_upper_bound(delta),
    }
}

/// Dependences between every pair of accesses nested in `root` that are
/// carried at a depth in `depths` (1-based, absolute). Returns `None` when
/// a pair cannot be analyzed.
pub fn dependences_in(
    func: &Function,
    root: OpId,
    depths: std::ops::RangeInclusive<usize>,
) -> Option<Vec<(OpId, OpId, Vec<DependenceComponent>)>> {
    let accesses = collect_accesses(func, Some(root));
    let mut found = Vec::new();
    for src in &accesses {
        for dst in &accesses {
            for depth in depths.clone() {
                match check_memref_access_dependence(func, src, dst, depth, true) {
                    DependenceResult::NoDependence => {}
                    DependenceResult::HasDependence(components) => found.push((src.op, dst.op, components)),
                    DependenceResult::Failure => return None,
                }
            }
        }
    }
    Some(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::{AffineExpr, AffineMap};
    use crate::ir::{ElementType, IrType, MemRefType, OpBuilder};

    fn memref(n: i64) -> IrType {
        IrType::MemRef(MemRefType::new(vec![n], ElementType::I32))
    }

    /// for i in 1..n { A[i] = A[i + offset] }
    fn shifted_copy(offset: i64) -> (Function, OpId, OpId, OpId) {
        let mut func = Function::new("f", vec![memref(64)]);
        let a = func.arguments[0];
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(1, 32, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, l.body);
        let map = AffineMap::new(1, 0, vec![AffineExpr::dim(0) + offset]);
        let v = b.load(a, map, vec![l.iv]);
        let st = b.store(v, a, AffineMap::identity(1), vec![l.iv]);
        let ld = b.func().defining_op(v).unwrap();
        (func, lp, ld, st)
    }

    #[test]
    fn test_flow_dependence_distance_one() {
        let (func, _, ld, st) = shifted_copy(-1);
        let src = MemRefAccess::from_op(&func, st).unwrap();
        let dst = MemRefAccess::from_op(&func, ld).unwrap();
        match check_memref_access_dependence(&func, &src, &dst, 1, true) {
            DependenceResult::HasDependence(c) => {
                assert_eq!(c.len(), 1);
                assert_eq!((c[0].lb, c[0].ub), (Some(1), Some(1)));
                assert_eq!(c[0].direction(), Direction::Lt);
            }
            other => panic!("expected a dependence, got {:?}", other),
        }
        // The load reads the previous iteration's value, never a later one.
        assert_eq!(
            check_memref_access_dependence(&func, &dst, &src, 1, false),
            DependenceResult::NoDependence
        );
    }

    #[test]
    fn test_same_iteration_is_loop_independent() {
        let (func, _, ld, st) = shifted_copy(0);
        let src = MemRefAccess::from_op(&func, ld).unwrap();
        let dst = MemRefAccess::from_op(&func, st).unwrap();
        assert_eq!(
            check_memref_access_dependence(&func, &src, &dst, 1, false),
            DependenceResult::NoDependence
        );
        assert!(check_memref_access_dependence(&func, &src, &dst, 2, false).has_dependence());
        assert_eq!(
            check_memref_access_dependence(&func, &dst, &src, 2, false),
            DependenceResult::NoDependence
        );
    }

    #[test]
    fn test_disjoint_ranges() {
        // for i in 0..16 { A[i] = A[i + 32] }
        let mut func = Function::new("f", vec![memref(64)]);
        let a = func.arguments[0];
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(0, 16, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, l.body);
        let v = b.load(a, AffineMap::new(1, 0, vec![AffineExpr::dim(0) + 32]), vec![l.iv]);
        b.store(v, a, AffineMap::identity(1), vec![l.iv]);
        assert_eq!(dependences_in(&func, lp, 1..=2), Some(vec![]));
    }

    #[test]
    fn test_direction_classification() {
        let c = |lb, ub| DependenceComponent {
            loop_op: OpId(0),
            lb,
            ub,
        };
        assert_eq!(c(Some(0), Some(0)).direction(), Direction::Eq);
        assert_eq!(c(Some(0), Some(3)).direction(), Direction::Le);
        assert_eq!(c(Some(-2), Some(-1)).direction(), Direction::Gt);
        assert_eq!(c(None, Some(0)).direction(), Direction::Ge);
        assert_eq!(c(None, None).direction(), Direction::Star);
    }

    #[test]
    fn test_precedes() {
        let (func, lp, ld, st) = shifted_copy(0);
        assert!(precedes(&func, ld, st));
        assert!(!precedes(&func, st, ld));
        assert!(!precedes(&func, lp, lp));
    }
}
