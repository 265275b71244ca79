//! Super-Vectorization
//!
//! Rewrites innermost perfect bands of `n` loops into loops over
//! `n`-dimensional vector chunks, where `n` is the rank of the virtual
//! vector shape. Band loop `k` must drive memref dimension `rank - n + k`
//! of every varying access with unit stride, every band loop must be
//! parallel, and trip counts must be multiples of the shape. Loads and
//! stores become vector transfers, arithmetic on vectors becomes vector
//! arithmetic, and scalars feeding vector operations are broadcast.

use super::parallelize::is_loop_parallel;
use super::{verify, AffinePass, ConfigError, OptimizationResult, PassError};
use crate::analysis::access::MemRefAccess;
use crate::analysis::loops::{annotate_trip_count, constant_trip_count, innermost_loops};
use crate::ir::{Function, IrType, OpId, OpKind, ValueId, VectorType};
use fxhash::{FxHashMap, FxHashSet};
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

/// Vector width used when no shape is configured.
pub const DEFAULT_VECTOR_WIDTH: i64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct VectorizeOptions {
    /// Virtual vector shape, outermost dimension first
    pub virtual_vector_size: Vec<i64>,
}

impl Default for VectorizeOptions {
    fn default() -> Self {
        Self {
            virtual_vector_size: vec![DEFAULT_VECTOR_WIDTH],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SuperVectorize {
    options: VectorizeOptions,
}

impl SuperVectorize {
    pub fn new(options: VectorizeOptions) -> Result<Self, ConfigError> {
        if options.virtual_vector_size.is_empty() {
            return Err(ConfigError::EmptyVectorShape);
        }
        if let Some((index, &value)) = options.virtual_vector_size.iter().enumerate().find(|(_, &v)| v <= 0) {
            return Err(ConfigError::NonPositiveVectorDim { index, value });
        }
        Ok(Self { options })
    }

    pub fn with_shape(shape: Vec<i64>) -> Result<Self, ConfigError> {
        Self::new(VectorizeOptions {
            virtual_vector_size: shape,
        })
    }

    pub fn shape(&self) -> &[i64] {
        &self.options.virtual_vector_size
    }
}

impl AffinePass for SuperVectorize {
    fn name(&self) -> &'static str {
        "affine-super-vectorize"
    }

    fn run_on_function(&self, func: &mut Function) -> Result<OptimizationResult, PassError> {
        verify(func)?;
        let mut vectorized = 0;
        for innermost in innermost_loops(func) {
            let Some(band) = innermost_band(func, innermost, self.shape().len()) else {
                continue;
            };
            if vectorize_band(func, &band, self.shape()) {
                vectorized += 1;
            }
        }
        let mut result = OptimizationResult::unchanged();
        result.record("bands_vectorized", vectorized);
        if vectorized > 0 {
            info!("vectorized {} loop bands in {} by {:?}", vectorized, func.name, self.shape());
        }
        Ok(result)
    }
}

/// The `depth` loops ending at `innermost`, outermost first, if they form a
/// perfect nest.
fn innermost_band(func: &Function, innermost: OpId, depth: usize) -> Option<Vec<OpId>> {
    let enclosing = func.enclosing_loops(innermost);
    if enclosing.len() + 1 < depth {
        return None;
    }
    let mut band: Vec<OpId> = enclosing[enclosing.len() + 1 - depth..].to_vec();
    band.push(innermost);
    band.windows(2)
        .all(|w| func.loop_op(w[0]).is_some_and(|l| func.block(l.body).ops == [w[1]]))
        .then_some(band)
}

/// How an operation of the band body is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    /// Same value in every lane; stays scalar.
    Uniform,
    /// One value per lane.
    Vector,
}

/// Vectorize `band` by `shape`. Returns false, leaving the band untouched,
/// when any requirement fails.
pub fn vectorize_band(func: &mut Function, band: &[OpId], shape: &[i64]) -> bool {
    let Some(&innermost) = band.last() else {
        return false;
    };
    if band.len() != shape.len() {
        return false;
    }
    for (&lp, &width) in band.iter().zip(shape) {
        let Some(l) = func.loop_op(lp) else {
            return false;
        };
        if l.step != 1 || constant_trip_count(func, lp).map_or(true, |tc| tc % width as u64 != 0) {
            debug!("{}: trip count is not a multiple of {}", lp, width);
            return false;
        }
        if !is_loop_parallel(func, lp) {
            debug!("{} is not parallel", lp);
            return false;
        }
    }

    let ivs: Vec<ValueId> = band.iter().filter_map(|&l| func.loop_op(l).map(|l| l.iv)).collect();
    let Some(body) = func.loop_op(innermost).map(|l| l.body) else {
        return false;
    };
    let Some(lanes) = classify(func, &func.block(body).ops, &ivs) else {
        return false;
    };

    trace!("vectorizing band {:?}", band);
    for (&lp, &width) in band.iter().zip(shape) {
        func.loop_op_mut(lp).step *= width;
        annotate_trip_count(func, lp);
    }

    let mut broadcasts: FxHashMap<ValueId, ValueId> = FxHashMap::default();
    for op in func.block(body).ops.clone() {
        if lanes.get(&op) != Some(&Lane::Vector) {
            continue;
        }
        let kind = func.op(op).kind.clone();
        match kind {
            OpKind::Load(access) => {
                let element = func.value_type(access.memref).element();
                let ty = VectorType::new(shape.to_vec(), element);
                if let Some(result) = func.op(op).result() {
                    func.set_value_type(result, IrType::Vector(ty.clone()));
                }
                func.op_mut(op).kind = OpKind::VectorLoad { access, ty };
            }
            OpKind::Store { value, access } => {
                let value = vector_operand(func, op, value, shape, &mut broadcasts);
                func.op_mut(op).kind = OpKind::VectorStore { value, access };
            }
            OpKind::Binary { op: bin, lhs, rhs } => {
                let lhs = vector_operand(func, op, lhs, shape, &mut broadcasts);
                let rhs = vector_operand(func, op, rhs, shape, &mut broadcasts);
                func.op_mut(op).kind = OpKind::Binary { op: bin, lhs, rhs };
                if let Some(result) = func.op(op).result() {
                    let element = func.value_type(result).element();
                    func.set_value_type(result, IrType::Vector(VectorType::new(shape.to_vec(), element)));
                }
            }
            _ => {}
        }
    }
    true
}

/// Decide the lane kind of every operation, or `None` if the body holds
/// something that cannot be vectorized.
fn classify(func: &Function, ops: &[OpId], ivs: &[ValueId]) -> Option<FxHashMap<OpId, Lane>> {
    let mut lanes = FxHashMap::default();
    let mut vector_values: FxHashSet<ValueId> = FxHashSet::default();
    for &op in ops {
        let lane = match &func.op(op).kind {
            OpKind::Constant(_) => Lane::Uniform,
            OpKind::Load(_) => {
                let access = MemRefAccess::from_op(func, op)?;
                if access_lanes(func, &access, ivs)? {
                    Lane::Vector
                } else {
                    Lane::Uniform
                }
            }
            OpKind::Store { .. } => {
                let access = MemRefAccess::from_op(func, op)?;
                if !access_lanes(func, &access, ivs)? {
                    debug!("{} stores to one address from every lane", op);
                    return None;
                }
                Lane::Vector
            }
            OpKind::Binary { lhs, rhs, .. } => {
                if vector_values.contains(lhs) || vector_values.contains(rhs) {
                    Lane::Vector
                } else {
                    Lane::Uniform
                }
            }
            other => {
                debug!("cannot vectorize {} in {}", other.name(), op);
                return None;
            }
        };
        if lane == Lane::Vector {
            vector_values.extend(func.op(op).result());
        }
        lanes.insert(op, lane);
    }
    Some(lanes)
}

/// Whether `access` varies with the band: `Some(true)` when band loop `k`
/// drives dimension `rank - n + k` with unit stride and no other
/// dimension, `Some(false)` when no band loop is involved, `None`
/// otherwise.
fn access_lanes(func: &Function, access: &MemRefAccess, ivs: &[ValueId]) -> Option<bool> {
    let vm = access.value_map(func).ok()?;
    let (forms, _) = vm.map.flatten().ok()?;
    let rank = forms.len();
    let n = ivs.len();
    let coeff = |result: usize, iv: ValueId| -> i64 {
        vm.dim_values()
            .iter()
            .position(|&v| v == iv)
            .map_or(0, |d| forms[result].dims[d])
    };
    let uses_band = (0..rank).any(|r| ivs.iter().any(|&iv| coeff(r, iv) != 0));
    if !uses_band {
        return Some(false);
    }
    if rank < n || forms.iter().any(|f| f.has_locals()) {
        return None;
    }
    for r in 0..rank {
        for (k, &iv) in ivs.iter().enumerate() {
            let expected = if r + n == rank + k { 1 } else { 0 };
            if coeff(r, iv) != expected {
                return None;
            }
        }
    }
    Some(true)
}

/// `value` as a vector operand of `user`, broadcasting uniform scalars
/// right before their first vector use.
fn vector_operand(
    func: &mut Function,
    user: OpId,
    value: ValueId,
    shape: &[i64],
    broadcasts: &mut FxHashMap<ValueId, ValueId>,
) -> ValueId {
    if matches!(func.value_type(value), IrType::Vector(_)) {
        return value;
    }
    if let Some(&b) = broadcasts.get(&value) {
        return b;
    }
    let ty = VectorType::new(shape.to_vec(), func.value_type(value).element());
    let block = func.op(user).parent;
    let index = func.position_in_block(user);
    let op = func.insert_op(block, index, OpKind::Broadcast { value, ty: ty.clone() }, vec![IrType::Vector(ty)]);
    let result = func.op(op).results[0];
    broadcasts.insert(value, result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::{AffineExpr, AffineMap};
    use crate::ir::interp::{run, ArgValue, Scalar};
    use crate::ir::{ElementType, MemRefType, OpBuilder};

    fn memref(shape: Vec<i64>) -> IrType {
        IrType::MemRef(MemRefType::new(shape, ElementType::I64))
    }

    fn ints(n: i64) -> Vec<Scalar> {
        (0..n).map(Scalar::Int).collect()
    }

    /// for i in 0..16 { B[i] = A[i + offset] + 3 }
    fn add_three(same_array: bool, offset: i64) -> (Function, OpId) {
        let mut func = Function::new("f", vec![memref(vec![32]), memref(vec![32])]);
        let a = func.arguments[0];
        let dst = if same_array { a } else { func.arguments[1] };
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(1, 17, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, l.body);
        let x = b.load(a, AffineMap::new(1, 0, vec![AffineExpr::dim(0) + offset]), vec![l.iv]);
        let three = b.constant_int(3, ElementType::I64);
        let y = b.add(x, three);
        b.store(y, dst, AffineMap::identity(1), vec![l.iv]);
        (func, lp)
    }

    #[test]
    fn test_one_dimensional() {
        let (mut func, lp) = add_three(false, 0);
        let args = || vec![ArgValue::Buffer(ints(32)), ArgValue::Buffer(vec![Scalar::Int(0); 32])];
        let before = run(&func, args()).unwrap();
        let result = SuperVectorize::with_shape(vec![4])
            .unwrap()
            .run_on_function(&mut func)
            .unwrap();
        assert_eq!(result.stat("bands_vectorized"), 1);
        assert_eq!(func.loop_op(lp).unwrap().step, 4);
        let body = func.loop_op(lp).unwrap().body;
        let kinds: Vec<&str> = func.block(body).ops.iter().map(|&op| func.op(op).kind.name()).collect();
        assert_eq!(kinds, vec!["vector_load", "constant", "broadcast", "add", "vector_store"]);
        let after = run(&func, args()).unwrap();
        assert_eq!(before.buffers, after.buffers);
    }

    #[test]
    fn test_carried_dependence_stays_scalar() {
        // A[i] = A[i - 1] + 3
        let (mut func, lp) = add_three(true, -1);
        let result = SuperVectorize::default().run_on_function(&mut func).unwrap();
        assert!(!result.modified);
        assert_eq!(func.loop_op(lp).unwrap().step, 1);
    }

    #[test]
    fn test_indivisible_trip_count_stays_scalar() {
        let (mut func, lp) = add_three(false, 0);
        let result = SuperVectorize::with_shape(vec![5]).unwrap().run_on_function(&mut func).unwrap();
        assert!(!result.modified);
        assert_eq!(func.loop_op(lp).unwrap().step, 1);
    }

    #[test]
    fn test_two_dimensional_band() {
        // for i in 0..4 { for j in 0..8 { B[i][j] = A[i][j] * A[i][j] } }
        let mut func = Function::new("f", vec![memref(vec![4, 8]), memref(vec![4, 8])]);
        let (a, b_arg) = (func.arguments[0], func.arguments[1]);
        let body = func.body;
        let outer = OpBuilder::at_end(&mut func, body).constant_for(0, 4, 1);
        let ol = func.loop_op(outer).unwrap().clone();
        let inner = OpBuilder::at_end(&mut func, ol.body).constant_for(0, 8, 1);
        let il = func.loop_op(inner).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, il.body);
        let x = b.load(a, AffineMap::identity(2), vec![ol.iv, il.iv]);
        let y = b.mul(x, x);
        b.store(y, b_arg, AffineMap::identity(2), vec![ol.iv, il.iv]);

        let args = || vec![ArgValue::Buffer(ints(32)), ArgValue::Buffer(vec![Scalar::Int(0); 32])];
        let before = run(&func, args()).unwrap();
        let pass = SuperVectorize::with_shape(vec![2, 4]).unwrap();
        assert_eq!(pass.run_on_function(&mut func).unwrap().stat("bands_vectorized"), 1);
        assert_eq!(func.loop_op(outer).unwrap().step, 2);
        assert_eq!(func.loop_op(inner).unwrap().step, 4);
        let after = run(&func, args()).unwrap();
        assert_eq!(before.buffers, after.buffers);
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        assert_eq!(SuperVectorize::with_shape(vec![]).unwrap_err(), ConfigError::EmptyVectorShape);
        assert_eq!(
            SuperVectorize::with_shape(vec![4, 0]).unwrap_err(),
            ConfigError::NonPositiveVectorDim { index: 1, value: 0 }
        );
    }
}
