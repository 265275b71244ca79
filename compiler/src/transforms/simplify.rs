//! Affine Structure Simplification
//!
//! Canonicalizes every map and integer set of a function, folds `if`
//! operations whose condition is trivially true or false, folds constant
//! `apply` operations and normalizes allocations with a non-identity layout
//! to an identity layout by composing the layout into every access.

use super::{verify, AffinePass, OptimizationResult, PassError};
use crate::affine::{AffineMap, FlatAffineConstraints, VarKind};
use crate::ir::{Function, IrType, Literal, MemRefType, OpId, OpKind, ValueId};
use log::{debug, info, trace};

#[derive(Debug, Clone, Default)]
pub struct SimplifyAffineStructures;

impl SimplifyAffineStructures {
    pub fn new() -> Self {
        Self
    }
}

impl AffinePass for SimplifyAffineStructures {
    fn name(&self) -> &'static str {
        "simplify-affine-structures"
    }

    fn run_on_function(&self, func: &mut Function) -> Result<OptimizationResult, PassError> {
        verify(func)?;
        let mut result = OptimizationResult::unchanged();
        result.record("maps_simplified", simplify_maps(func));
        result.record("ifs_folded", fold_trivial_ifs(func));
        result.record("applies_folded", fold_constant_applies(func));
        result.record("memrefs_normalized", normalize_memrefs(func));
        if result.modified {
            info!("simplified affine structures in {}: {:?}", func.name, result.stats);
        }
        Ok(result)
    }
}

fn simplify_maps(func: &mut Function) -> usize {
    let mut changed = 0;
    for op in func.walk() {
        let kind = &mut func.op_mut(op).kind;
        kind.for_each_map_mut(|map| {
            let simplified = map.simplify();
            if simplified != *map {
                *map = simplified;
                changed += 1;
            }
        });
        if let OpKind::If { set, .. } = kind {
            let simplified = set.simplify();
            if simplified != *set {
                *set = simplified;
                changed += 1;
            }
        }
    }
    changed
}

/// Inline the taken branch of `if` operations whose set is the universe or
/// provably empty.
fn fold_trivial_ifs(func: &mut Function) -> usize {
    let mut folded = 0;
    for op in func.walk() {
        if !func.is_live(op) {
            continue;
        }
        let OpKind::If {
            set,
            then_block,
            else_block,
            ..
        } = &func.op(op).kind
        else {
            continue;
        };
        let taken = if set.is_universe() {
            Some(*then_block)
        } else if set.is_trivially_empty() {
            *else_block
        } else {
            continue;
        };
        trace!("folding trivial if {}", op);
        if let Some(block) = taken {
            for inner in func.block(block).ops.clone() {
                func.move_op_before(inner, op);
            }
        }
        func.erase_op(op);
        folded += 1;
    }
    folded
}

fn fold_constant_applies(func: &mut Function) -> usize {
    let mut folded = 0;
    for op in func.walk() {
        let value = match &func.op(op).kind {
            OpKind::Apply { map, .. } => map.single_constant_result(),
            _ => None,
        };
        let Some(value) = value else { continue };
        let result = func.op(op).results[0];
        func.op_mut(op).kind = OpKind::Constant(Literal::Int(value));
        trace!("folded {} to constant {}", result, value);
        folded += 1;
    }
    folded
}

/// Rewrite allocations with a non-identity layout whose every use is a
/// scalar access or a dealloc.
fn normalize_memrefs(func: &mut Function) -> usize {
    let mut normalized = 0;
    for op in func.walk() {
        let OpKind::Alloc { ty } = &func.op(op).kind else {
            continue;
        };
        let Some(layout) = ty.layout.clone() else {
            continue;
        };
        if ty.has_identity_layout() {
            let identity = MemRefType::new(ty.shape.clone(), ty.element).with_memory_space(ty.memory_space);
            set_alloc_type(func, op, identity);
            normalized += 1;
            continue;
        }
        let memref = func.op(op).results[0];
        if !only_accessed_directly(func, memref) {
            debug!("{} escapes through a non-affine use, keeping its layout", memref);
            continue;
        }
        let Some(shape) = normalized_shape(&ty.shape, &layout) else {
            debug!("layout of {} is not bounded, keeping it", memref);
            continue;
        };
        let new_ty = MemRefType::new(shape, ty.element).with_memory_space(ty.memory_space);
        for user in func.uses(memref) {
            if let Some(access) = func.op_mut(user).kind.access_mut() {
                access.map = layout.compose(&access.map).simplify();
            }
        }
        set_alloc_type(func, op, new_ty);
        normalized += 1;
    }
    normalized
}

fn set_alloc_type(func: &mut Function, op: OpId, ty: MemRefType) {
    let memref = func.op(op).results[0];
    func.set_value_type(memref, IrType::MemRef(ty.clone()));
    func.op_mut(op).kind = OpKind::Alloc { ty };
}

fn only_accessed_directly(func: &Function, memref: ValueId) -> bool {
    func.uses(memref).into_iter().all(|user| match &func.op(user).kind {
        OpKind::Load(a) => a.memref == memref,
        OpKind::Store { value, access } => *value != memref && access.memref == memref,
        OpKind::Dealloc { .. } => true,
        _ => false,
    })
}

/// Constant extent of each layout result over the logical shape.
fn normalized_shape(shape: &[i64], layout: &AffineMap) -> Option<Vec<i64>> {
    if layout.num_symbols != 0 || layout.num_dims as usize != shape.len() {
        return None;
    }
    let (forms, flattener) = layout.flatten().ok()?;
    let rank = shape.len();
    let mut cst = FlatAffineConstraints::with_vars(rank, 0);
    for (d, &size) in shape.iter().enumerate() {
        cst.add_lower_bound(d, 0);
        cst.add_upper_bound(d, size - 1);
    }
    let dims: Vec<usize> = (0..rank).collect();
    let locals = cst.add_local_divs(&flattener, &dims, &[]);
    forms
        .iter()
        .map(|form| {
            let mut sys = cst.clone();
            let row = sys.form_to_row(form, &dims, &[], &locals);
            let r = sys.append_var(VarKind::Dim, None);
            let mut eq: Vec<i64> = row.iter().map(|c| -c).collect();
            eq.insert(r, 1);
            sys.add_equality(eq);
            let lb = sys.constant_lower_bound(r)?;
            let ub = sys.constant_upper_bound(r)?;
            (lb >= 0).then_some(ub + 1)
        })
        .collect()
}
