//! Memory Accesses and Regions
//!
//! [`MemRefAccess`] views a load or store as `memref[map(operands)]`.
//! [`MemRegion`] is the set of elements an access touches while the loops
//! below a given depth run, as a constraint system over the memref's
//! dimensions with outer induction variables and top-level values as
//! symbols. [`RegionBox`] over-approximates a region by a box with
//! symbolic lower bounds and constant extents; boxes of the same memref can
//! be unioned.

use super::loops::{add_loop_domain, loop_depth};
use super::value_map::{unify_operands, AffineValueMap};
use crate::affine::{AffineExpr, AffineMap, FlatAffineConstraints, NotAffine, VarKind};
use crate::ir::{Function, IrType, MemRefType, OpId, OpKind, ValueId};
use fxhash::FxHashSet;
use indexmap::IndexMap;
use log::trace;

#[derive(Debug, Clone, PartialEq)]
pub struct MemRefAccess {
    pub op: OpId,
    pub memref: ValueId,
    pub map: AffineMap,
    pub operands: Vec<ValueId>,
    pub is_store: bool,
    /// Vector shape for vector accesses; it covers the trailing dimensions.
    pub vector_shape: Option<Vec<i64>>,
}

impl MemRefAccess {
    /// View `op` as an access, if it is a (vector) load or store.
    pub fn from_op(func: &Function, op: OpId) -> Option<Self> {
        let kind = &func.op(op).kind;
        let access = kind.access()?;
        let vector_shape = match kind {
            OpKind::VectorLoad { ty, .. } => Some(ty.shape.clone()),
            OpKind::VectorStore { value, .. } => match func.value_type(*value) {
                IrType::Vector(v) => Some(v.shape.clone()),
                _ => None,
            },
            _ => None,
        };
        Some(Self {
            op,
            memref: access.memref,
            map: access.map.clone(),
            operands: access.operands.clone(),
            is_store: kind.is_store(),
            vector_shape,
        })
    }

    pub fn rank(&self) -> usize {
        self.map.num_results()
    }

    /// Number of consecutive elements touched along memref dimension `dim`.
    pub fn extent(&self, dim: usize) -> i64 {
        match &self.vector_shape {
            Some(shape) if dim + shape.len() >= self.rank() => shape[dim + shape.len() - self.rank()],
            _ => 1,
        }
    }

    pub fn value_map(&self, func: &Function) -> Result<AffineValueMap, NotAffine> {
        AffineValueMap::compose(func, &self.map, &self.operands)
    }

    /// Whether both accesses provably touch the same elements: same memref,
    /// same footprint shape and composed index functions that agree.
    pub fn is_same_address(&self, other: &MemRefAccess, func: &Function) -> bool {
        if self.memref != other.memref || self.vector_shape != other.vector_shape {
            return false;
        }
        let (Ok(a), Ok(b)) = (self.value_map(func), other.value_map(func)) else {
            return false;
        };
        let (exprs, _) = unify_operands(&[(&a.map, a.operands.as_slice()), (&b.map, b.operands.as_slice())]);
        exprs[0]
            .iter()
            .zip(&exprs[1])
            .all(|(x, y)| (x.clone() - y.clone()).simplify().as_constant() == Some(0))
    }
}

/// Accesses nested in `root` (or the whole function), in program order.
pub fn collect_accesses(func: &Function, root: Option<OpId>) -> Vec<MemRefAccess> {
    let ops = match root {
        Some(op) => func.walk_nested(op),
        None => func.walk(),
    };
    ops.into_iter().filter_map(|op| MemRefAccess::from_op(func, op)).collect()
}

/// Whether two memref values may refer to overlapping storage. The IR has
/// no view operations, so distinct memref values are distinct buffers.
pub fn may_alias(_func: &Function, a: ValueId, b: ValueId) -> bool {
    a == b
}

/// Elements touched by one access over the loops at depth `>= loop_depth`.
#[derive(Debug, Clone)]
pub struct MemRegion {
    pub memref: ValueId,
    pub is_write: bool,
    /// Variables `0..rank` are the memref dimensions; the rest are symbols
    /// carrying their value.
    pub cst: FlatAffineConstraints,
    pub rank: usize,
}

impl MemRegion {
    pub fn compute(func: &Function, access: &MemRefAccess, loop_depth: usize) -> Result<Self, NotAffine> {
        let ty = func.value_type(access.memref).as_memref().ok_or(NotAffine)?.clone();
        let rank = access.rank();
        let inner: Vec<OpId> = func.enclosing_loops(access.op).into_iter().skip(loop_depth).collect();
        let inner_ivs: FxHashSet<ValueId> = inner
            .iter()
            .filter_map(|&l| func.loop_op(l).map(|l| l.iv))
            .collect();

        let mut cst = FlatAffineConstraints::new();
        for _ in 0..rank {
            cst.append_var(VarKind::Dim, None);
        }
        let mut resolve = |cst: &mut FlatAffineConstraints, v: ValueId, _is_dim: bool| {
            cst.find_var(v).unwrap_or_else(|| {
                let kind = if inner_ivs.contains(&v) { VarKind::Dim } else { VarKind::Symbol };
                cst.append_var(kind, Some(v))
            })
        };

        let vmap = access.value_map(func)?;
        let rows = vmap.add_to_constraints(&mut cst, &mut resolve)?;
        let n = cst.num_vars();
        for (k, row) in rows.into_iter().enumerate() {
            // d_k - expr_k
            let mut diff: Vec<i64> = row.iter().map(|c| -c).collect();
            diff[k] += 1;
            let extent = access.extent(k);
            if extent == 1 {
                cst.add_equality(diff);
            } else {
                let mut upper: Vec<i64> = diff.iter().map(|c| -c).collect();
                upper[n] += extent - 1;
                cst.add_inequality(diff);
                cst.add_inequality(upper);
            }
        }
        for &l in &inner {
            add_loop_domain(&mut cst, func, l, &mut resolve)?;
        }
        cst.project_out_where(|_, kind, id| {
            kind == VarKind::Local || id.is_some_and(|v| inner_ivs.contains(&v))
        });
        for (k, &size) in ty.shape.iter().enumerate() {
            cst.add_lower_bound(k, 0);
            cst.add_upper_bound(k, size - 1);
        }
        cst.remove_duplicates();
        Ok(Self {
            memref: access.memref,
            is_write: access.is_store,
            cst,
            rank,
        })
    }

    pub fn bounding_box(&self, ty: &MemRefType) -> Option<RegionBox> {
        RegionBox::from_region(self, ty)
    }
}

/// `sum(coeff * value) + constant`, terms sorted by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolicBound {
    pub terms: Vec<(ValueId, i64)>,
    pub constant: i64,
}

impl SymbolicBound {
    pub fn constant(value: i64) -> Self {
        Self {
            terms: Vec::new(),
            constant: value,
        }
    }

    pub fn as_constant(&self) -> Option<i64> {
        self.terms.is_empty().then_some(self.constant)
    }

    /// The bound as a map over symbols, with its operands.
    pub fn to_map(&self) -> (AffineExpr, Vec<ValueId>) {
        let expr = self
            .terms
            .iter()
            .enumerate()
            .fold(AffineExpr::Constant(self.constant), |acc, (i, &(_, c))| {
                acc + AffineExpr::symbol(i as u32) * c
            });
        (expr.simplify(), self.terms.iter().map(|&(v, _)| v).collect())
    }
}

/// Box `lower[k] <= d_k < lower[k] + extents[k]` covering a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionBox {
    pub memref: ValueId,
    pub lower: Vec<SymbolicBound>,
    pub extents: Vec<i64>,
    pub shape: Vec<i64>,
}

impl RegionBox {
    /// Tightest box whose per-dimension bounds appear as unit-coefficient
    /// constraints with a constant difference. The memref shape always
    /// provides one such pair.
    pub fn from_region(region: &MemRegion, ty: &MemRefType) -> Option<Self> {
        let mut lower = Vec::with_capacity(region.rank);
        let mut extents = Vec::with_capacity(region.rank);
        for k in 0..region.rank {
            let mut cst = region.cst.clone();
            let others: Vec<usize> = (0..region.rank).filter(|&d| d != k).collect();
            cst.project_out(&others);
            let n = cst.num_vars();
            let (lowers, uppers) = cst.bound_rows(0);

            let symbolic = |row: &[i64], sign: i64| -> Option<SymbolicBound> {
                let mut terms = Vec::new();
                for (pos, &c) in row.iter().enumerate().take(n).skip(1) {
                    if c != 0 {
                        terms.push((cst.id(pos)?, sign * c));
                    }
                }
                terms.sort();
                Some(SymbolicBound {
                    terms,
                    constant: sign * row[n],
                })
            };
            // d >= -(rest)  and  d <= rest
            let lbs: Vec<SymbolicBound> = lowers
                .iter()
                .filter(|r| r[0] == 1)
                .filter_map(|r| symbolic(r, -1))
                .collect();
            let ubs: Vec<SymbolicBound> = uppers
                .iter()
                .filter(|r| r[0] == -1)
                .filter_map(|r| symbolic(r, 1))
                .collect();

            let mut best: Option<(SymbolicBound, i64)> = None;
            for lb in &lbs {
                for ub in &ubs {
                    if lb.terms != ub.terms {
                        continue;
                    }
                    let extent = ub.constant - lb.constant + 1;
                    if extent >= 1 && best.as_ref().map_or(true, |(_, e)| extent < *e) {
                        best = Some((lb.clone(), extent));
                    }
                }
            }
            let (lb, extent) = best?;
            lower.push(lb);
            extents.push(extent);
        }
        trace!("region box for {}: {:?}", region.memref, extents);
        Some(Self {
            memref: region.memref,
            lower,
            extents,
            shape: ty.shape.clone(),
        })
    }

    pub fn num_elements(&self) -> i64 {
        self.extents.iter().product()
    }

    pub fn size_bytes(&self, ty: &MemRefType) -> u64 {
        self.num_elements() as u64 * ty.element.size_bytes()
    }

    /// Smallest box containing both. Dimensions whose lower bounds differ
    /// symbolically fall back to the whole memref extent.
    pub fn union(&mut self, other: &RegionBox) {
        for k in 0..self.extents.len() {
            if self.lower[k].terms == other.lower[k].terms {
                let lo = self.lower[k].constant.min(other.lower[k].constant);
                let hi = (self.lower[k].constant + self.extents[k]).max(other.lower[k].constant + other.extents[k]);
                self.lower[k].constant = lo;
                self.extents[k] = hi - lo;
            } else {
                self.lower[k] = SymbolicBound::constant(0);
                self.extents[k] = self.shape[k];
            }
        }
    }

    /// Whether the box provably covers the whole memref.
    pub fn covers_memref(&self) -> bool {
        self.lower.iter().all(|l| l.as_constant() == Some(0)) && self.extents == self.shape
    }
}

/// Union of the regions of every access to one memref inside a loop.
#[derive(Debug, Clone)]
pub struct RegionSummary {
    pub bounding_box: RegionBox,
    pub has_read: bool,
    pub has_write: bool,
    pub accesses: Vec<OpId>,
}

/// Per-memref regions of the accesses nested in `loop_op`, in order of
/// first access.
pub fn memref_regions(func: &Function, loop_op: OpId) -> Result<IndexMap<ValueId, RegionSummary>, NotAffine> {
    let depth = loop_depth(func, loop_op);
    let mut regions: IndexMap<ValueId, RegionSummary> = IndexMap::new();
    for access in collect_accesses(func, Some(loop_op)) {
        let region = MemRegion::compute(func, &access, depth)?;
        let ty = func.value_type(access.memref).as_memref().ok_or(NotAffine)?;
        let bbox = region.bounding_box(ty).ok_or(NotAffine)?;
        match regions.get_mut(&access.memref) {
            Some(summary) => {
                summary.bounding_box.union(&bbox);
                summary.has_read |= !access.is_store;
                summary.has_write |= access.is_store;
                summary.accesses.push(access.op);
            }
            None => {
                regions.insert(
                    access.memref,
                    RegionSummary {
                        bounding_box: bbox,
                        has_read: !access.is_store,
                        has_write: access.is_store,
                        accesses: vec![access.op],
                    },
                );
            }
        }
    }
    Ok(regions)
}

/// Bytes touched by all accesses nested in `loop_op`, if every access is
/// analyzable.
pub fn footprint_bytes(func: &Function, loop_op: OpId) -> Option<u64> {
    let regions = memref_regions(func, loop_op).ok()?;
    regions.iter().try_fold(0u64, |total, (&memref, summary)| {
        let ty = func.value_type(memref).as_memref()?;
        Some(total + summary.bounding_box.size_bytes(ty))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AffineBound, ElementType, OpBuilder};

    fn memref(shape: Vec<i64>) -> IrType {
        IrType::MemRef(MemRefType::new(shape, ElementType::F32))
    }

    #[test]
    fn test_region_of_shifted_access() {
        // for i in 0..8 { A[i + 2] }
        let mut func = Function::new("f", vec![memref(vec![16])]);
        let a = func.arguments[0];
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(0, 8, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let map = AffineMap::new(1, 0, vec![AffineExpr::dim(0) + 2]);
        OpBuilder::at_end(&mut func, l.body).load(a, map, vec![l.iv]);

        let regions = memref_regions(&func, lp).unwrap();
        let bbox = &regions[&a].bounding_box;
        assert_eq!(bbox.lower[0].as_constant(), Some(2));
        assert_eq!(bbox.extents, vec![8]);
        assert_eq!(footprint_bytes(&func, lp), Some(32));
    }

    #[test]
    fn test_region_symbolic_in_outer_iv() {
        // for i in 0..64 step 8 { for j in i..i+8 { A[j] } }
        let mut func = Function::new("f", vec![memref(vec![64])]);
        let a = func.arguments[0];
        let body = func.body;
        let outer = OpBuilder::at_end(&mut func, body).constant_for(0, 64, 8);
        let o = func.loop_op(outer).unwrap().clone();
        let inner = OpBuilder::at_end(&mut func, o.body).for_loop(
            AffineBound {
                map: AffineMap::identity(1),
                operands: vec![o.iv],
            },
            AffineBound {
                map: AffineMap::new(1, 0, vec![AffineExpr::dim(0) + 8]),
                operands: vec![o.iv],
            },
            1,
        );
        let i = func.loop_op(inner).unwrap().clone();
        OpBuilder::at_end(&mut func, i.body).load(a, AffineMap::identity(1), vec![i.iv]);

        let regions = memref_regions(&func, inner).unwrap();
        let bbox = &regions[&a].bounding_box;
        assert_eq!(bbox.lower[0].terms, vec![(o.iv, 1)]);
        assert_eq!(bbox.lower[0].constant, 0);
        assert_eq!(bbox.extents, vec![8]);

        // At the outer loop the whole array is touched.
        let regions = memref_regions(&func, outer).unwrap();
        assert_eq!(regions[&a].bounding_box.extents, vec![64]);
    }

    #[test]
    fn test_box_union() {
        let mut a = RegionBox {
            memref: ValueId(0),
            lower: vec![SymbolicBound::constant(0)],
            extents: vec![4],
            shape: vec![16],
        };
        let b = RegionBox {
            memref: ValueId(0),
            lower: vec![SymbolicBound::constant(6)],
            extents: vec![2],
            shape: vec![16],
        };
        a.union(&b);
        assert_eq!(a.extents, vec![8]);
        let c = RegionBox {
            memref: ValueId(0),
            lower: vec![SymbolicBound {
                terms: vec![(ValueId(3), 1)],
                constant: 0,
            }],
            extents: vec![1],
            shape: vec![16],
        };
        a.union(&c);
        assert!(a.covers_memref());
    }

    #[test]
    fn test_alias_rules() {
        let mut func = Function::new("f", vec![memref(vec![4]), memref(vec![4])]);
        let (a, b) = (func.arguments[0], func.arguments[1]);
        let body = func.body;
        let t = OpBuilder::at_end(&mut func, body).alloc(MemRefType::new(vec![4], ElementType::F32));
        assert!(!may_alias(&func, a, b));
        assert!(!may_alias(&func, a, t));
        assert!(may_alias(&func, t, t));
    }
}
