//! Reference Interpreter
//!
//! Executes a [`Function`] directly over its structured form. Buffers are
//! flat vectors in row-major order over their physical shape (the image of
//! the layout map, if any). Every scalar memory access is appended to a
//! trace, which is what transformation tests compare before and after a
//! rewrite.
//!
//! DMA transfers complete synchronously at `dma_start`; elements that fall
//! outside either buffer are skipped. Calls are opaque and do nothing.

use super::function::Function;
use super::ops::{Access, BinaryOp, Literal, OpKind};
use super::types::{IrType, MemRefType};
use super::{BlockId, OpId, ValueId};
use fxhash::FxHashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_int(self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(v),
            Scalar::Float(_) => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RtValue {
    Scalar(Scalar),
    Vector(Vec<Scalar>),
    Buffer(usize),
}

/// Argument passed to [`run`].
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Index(i64),
    Scalar(Scalar),
    /// Initial contents of a memref argument, in physical row-major order.
    Buffer(Vec<Scalar>),
}

/// Which buffer an access touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferRef {
    Argument(usize),
    /// The n-th buffer allocated during execution.
    Alloc(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub buffer: BufferRef,
    pub offset: usize,
    pub value: Scalar,
    pub is_write: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Execution {
    /// Final contents of every memref argument, in argument order.
    pub buffers: Vec<Vec<Scalar>>,
    pub trace: Vec<TraceEvent>,
    /// How many times each operation executed.
    pub op_counts: FxHashMap<OpId, u64>,
}

impl Execution {
    /// Trace events on argument buffers only.
    pub fn argument_trace(&self) -> Vec<TraceEvent> {
        self.trace
            .iter()
            .filter(|e| matches!(e.buffer, BufferRef::Argument(_)))
            .cloned()
            .collect()
    }

    pub fn count(&self, op: OpId) -> u64 {
        self.op_counts.get(&op).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterpError {
    ArgumentMismatch(String),
    UndefinedValue(ValueId),
    OutOfBounds { memref: ValueId, indices: Vec<i64> },
    UseAfterFree(ValueId),
    DivisionByZero,
    TypeError(String),
    /// A map could not be evaluated (semi-affine with a bad divisor).
    MapEvaluation(String),
}

impl fmt::Display for InterpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpError::ArgumentMismatch(msg) => write!(f, "Argument mismatch: {}", msg),
            InterpError::UndefinedValue(v) => write!(f, "Undefined value: {}", v),
            InterpError::OutOfBounds { memref, indices } => {
                write!(f, "Out of bounds access to {} at {:?}", memref, indices)
            }
            InterpError::UseAfterFree(v) => write!(f, "Use of deallocated buffer {}", v),
            InterpError::DivisionByZero => write!(f, "Division by zero"),
            InterpError::TypeError(msg) => write!(f, "Type error: {}", msg),
            InterpError::MapEvaluation(msg) => write!(f, "Map evaluation failed: {}", msg),
        }
    }
}

impl std::error::Error for InterpError {}

struct BufferState {
    origin: BufferRef,
    ty: MemRefType,
    physical_shape: Vec<i64>,
    data: Vec<Scalar>,
    freed: bool,
}

impl BufferState {
    fn new(origin: BufferRef, ty: MemRefType) -> Result<Self, InterpError> {
        let physical_shape = physical_shape(&ty)?;
        let zero = if ty.element.is_float() {
            Scalar::Float(0.0)
        } else {
            Scalar::Int(0)
        };
        let size = physical_shape.iter().product::<i64>().max(0) as usize;
        Ok(Self {
            origin,
            ty,
            physical_shape,
            data: vec![zero; size],
            freed: false,
        })
    }

    /// Physical offset of logical `indices`, or `None` when out of bounds.
    fn offset(&self, indices: &[i64]) -> Option<usize> {
        if indices.len() != self.ty.rank() || indices.iter().zip(&self.ty.shape).any(|(&i, &n)| i < 0 || i >= n) {
            return None;
        }
        let physical = match &self.ty.layout {
            Some(layout) => layout.eval(indices, &[])?,
            None => indices.to_vec(),
        };
        let mut offset = 0i64;
        for (&i, &n) in physical.iter().zip(&self.physical_shape) {
            if i < 0 || i >= n {
                return None;
            }
            offset = offset * n + i;
        }
        Some(offset as usize)
    }
}

/// Extent of each layout result over the logical shape (the shape itself
/// for the identity layout).
fn physical_shape(ty: &MemRefType) -> Result<Vec<i64>, InterpError> {
    let Some(layout) = &ty.layout else {
        return Ok(ty.shape.clone());
    };
    let mut extents = vec![0i64; layout.num_results()];
    let mut index = vec![0i64; ty.rank()];
    if ty.shape.iter().any(|&n| n <= 0) {
        return Ok(extents);
    }
    loop {
        let physical = layout
            .eval(&index, &[])
            .ok_or_else(|| InterpError::MapEvaluation(layout.to_string()))?;
        for (e, p) in extents.iter_mut().zip(physical) {
            *e = (*e).max(p + 1);
        }
        // Advance the odometer.
        let mut d = ty.rank();
        loop {
            if d == 0 {
                return Ok(extents);
            }
            d -= 1;
            index[d] += 1;
            if index[d] < ty.shape[d] {
                break;
            }
            index[d] = 0;
        }
    }
}

struct Interpreter<'f> {
    func: &'f Function,
    env: FxHashMap<ValueId, RtValue>,
    buffers: Vec<BufferState>,
    allocs: usize,
    trace: Vec<TraceEvent>,
    op_counts: FxHashMap<OpId, u64>,
}

/// Run `func` with the given arguments.
pub fn run(func: &Function, args: Vec<ArgValue>) -> Result<Execution, InterpError> {
    if args.len() != func.arguments.len() {
        return Err(InterpError::ArgumentMismatch(format!(
            "expected {} arguments, got {}",
            func.arguments.len(),
            args.len()
        )));
    }
    let mut interp = Interpreter {
        func,
        env: FxHashMap::default(),
        buffers: Vec::new(),
        allocs: 0,
        trace: Vec::new(),
        op_counts: FxHashMap::default(),
    };
    for (i, (&param, arg)) in func.arguments.iter().zip(args).enumerate() {
        let value = match (func.value_type(param), arg) {
            (IrType::MemRef(ty), ArgValue::Buffer(data)) => {
                let mut state = BufferState::new(BufferRef::Argument(i), ty.clone())?;
                if data.len() != state.data.len() {
                    return Err(InterpError::ArgumentMismatch(format!(
                        "argument {} needs {} elements, got {}",
                        i,
                        state.data.len(),
                        data.len()
                    )));
                }
                state.data = data;
                interp.buffers.push(state);
                RtValue::Buffer(interp.buffers.len() - 1)
            }
            (IrType::Scalar(_), ArgValue::Index(v)) => RtValue::Scalar(Scalar::Int(v)),
            (IrType::Scalar(_), ArgValue::Scalar(s)) => RtValue::Scalar(s),
            (ty, arg) => {
                return Err(InterpError::ArgumentMismatch(format!(
                    "argument {} of type {} given {:?}",
                    i, ty, arg
                )))
            }
        };
        interp.env.insert(param, value);
    }

    interp.exec_block(func.body)?;

    let buffers = interp
        .buffers
        .into_iter()
        .filter(|b| matches!(b.origin, BufferRef::Argument(_)))
        .map(|b| b.data)
        .collect();
    Ok(Execution {
        buffers,
        trace: interp.trace,
        op_counts: interp.op_counts,
    })
}

enum Flow {
    Continue,
    Return,
}

impl<'f> Interpreter<'f> {
    fn exec_block(&mut self, block: BlockId) -> Result<Flow, InterpError> {
        let func = self.func;
        for &op in &func.block(block).ops {
            if let Flow::Return = self.exec_op(op)? {
                return Ok(Flow::Return);
            }
        }
        Ok(Flow::Continue)
    }

    fn get(&self, value: ValueId) -> Result<&RtValue, InterpError> {
        self.env.get(&value).ok_or(InterpError::UndefinedValue(value))
    }

    fn int(&self, value: ValueId) -> Result<i64, InterpError> {
        match self.get(value)? {
            RtValue::Scalar(Scalar::Int(v)) => Ok(*v),
            other => Err(InterpError::TypeError(format!("{} is not an integer: {:?}", value, other))),
        }
    }

    fn ints(&self, values: &[ValueId]) -> Result<Vec<i64>, InterpError> {
        values.iter().map(|&v| self.int(v)).collect()
    }

    fn eval_map(&self, map: &crate::affine::AffineMap, operands: &[ValueId]) -> Result<Vec<i64>, InterpError> {
        let values = self.ints(operands)?;
        let (dims, symbols) = values.split_at(map.num_dims as usize);
        map.eval(dims, symbols)
            .ok_or_else(|| InterpError::MapEvaluation(map.to_string()))
    }

    fn buffer_index(&self, memref: ValueId) -> Result<usize, InterpError> {
        match self.get(memref)? {
            RtValue::Buffer(b) if self.buffers[*b].freed => Err(InterpError::UseAfterFree(memref)),
            RtValue::Buffer(b) => Ok(*b),
            other => Err(InterpError::TypeError(format!("{} is not a buffer: {:?}", memref, other))),
        }
    }

    fn access_indices(&self, access: &Access) -> Result<(usize, Vec<i64>), InterpError> {
        let buffer = self.buffer_index(access.memref)?;
        let indices = self.eval_map(&access.map, &access.operands)?;
        Ok((buffer, indices))
    }

    fn read(&mut self, memref: ValueId, buffer: usize, indices: &[i64]) -> Result<Scalar, InterpError> {
        let state = &self.buffers[buffer];
        let offset = state.offset(indices).ok_or_else(|| InterpError::OutOfBounds {
            memref,
            indices: indices.to_vec(),
        })?;
        let value = state.data[offset];
        self.trace.push(TraceEvent {
            buffer: state.origin,
            offset,
            value,
            is_write: false,
        });
        Ok(value)
    }

    fn write(&mut self, memref: ValueId, buffer: usize, indices: &[i64], value: Scalar) -> Result<(), InterpError> {
        let state = &mut self.buffers[buffer];
        let offset = state.offset(indices).ok_or_else(|| InterpError::OutOfBounds {
            memref,
            indices: indices.to_vec(),
        })?;
        state.data[offset] = value;
        self.trace.push(TraceEvent {
            buffer: state.origin,
            offset,
            value,
            is_write: true,
        });
        Ok(())
    }

    fn set_result(&mut self, op: OpId, value: RtValue) {
        if let Some(result) = self.func.op(op).result() {
            self.env.insert(result, value);
        }
    }

    fn exec_op(&mut self, id: OpId) -> Result<Flow, InterpError> {
        *self.op_counts.entry(id).or_insert(0) += 1;
        let func = self.func;
        let op = func.op(id);
        match &op.kind {
            OpKind::Constant(Literal::Int(v)) => self.set_result(id, RtValue::Scalar(Scalar::Int(*v))),
            OpKind::Constant(Literal::Float(v)) => self.set_result(id, RtValue::Scalar(Scalar::Float(*v))),
            OpKind::Binary { op: bin, lhs, rhs } => {
                let value = match (self.get(*lhs)?.clone(), self.get(*rhs)?.clone()) {
                    (RtValue::Scalar(a), RtValue::Scalar(b)) => RtValue::Scalar(binary(*bin, a, b)?),
                    (RtValue::Vector(a), RtValue::Vector(b)) if a.len() == b.len() => RtValue::Vector(
                        a.into_iter()
                            .zip(b)
                            .map(|(x, y)| binary(*bin, x, y))
                            .collect::<Result<_, _>>()?,
                    ),
                    (a, b) => {
                        return Err(InterpError::TypeError(format!(
                            "mismatched operands to {}: {:?}, {:?}",
                            bin.name(),
                            a,
                            b
                        )))
                    }
                };
                self.set_result(id, value);
            }
            OpKind::Apply { map, operands } => {
                let result = self.eval_map(map, operands)?;
                self.set_result(id, RtValue::Scalar(Scalar::Int(result[0])));
            }
            OpKind::For(l) => {
                let lb = self
                    .eval_map(&l.lower.map, &l.lower.operands)?
                    .into_iter()
                    .max()
                    .unwrap_or(0);
                let ub = self
                    .eval_map(&l.upper.map, &l.upper.operands)?
                    .into_iter()
                    .min()
                    .unwrap_or(0);
                let mut iv = lb;
                while iv < ub {
                    self.env.insert(l.iv, RtValue::Scalar(Scalar::Int(iv)));
                    if let Flow::Return = self.exec_block(l.body)? {
                        return Ok(Flow::Return);
                    }
                    iv += l.step;
                }
            }
            OpKind::If {
                set,
                operands,
                then_block,
                else_block,
            } => {
                let values = self.ints(operands)?;
                let (dims, symbols) = values.split_at(set.num_dims as usize);
                let taken = set
                    .contains(dims, symbols)
                    .ok_or_else(|| InterpError::MapEvaluation(set.to_string()))?;
                let block = if taken { Some(*then_block) } else { *else_block };
                if let Some(block) = block {
                    if let Flow::Return = self.exec_block(block)? {
                        return Ok(Flow::Return);
                    }
                }
            }
            OpKind::Load(access) => {
                let (buffer, indices) = self.access_indices(access)?;
                let value = self.read(access.memref, buffer, &indices)?;
                self.set_result(id, RtValue::Scalar(value));
            }
            OpKind::Store { value, access } => {
                let value = match self.get(*value)? {
                    RtValue::Scalar(s) => *s,
                    other => return Err(InterpError::TypeError(format!("cannot store {:?}", other))),
                };
                let (buffer, indices) = self.access_indices(access)?;
                self.write(access.memref, buffer, &indices, value)?;
            }
            OpKind::VectorLoad { access, ty } => {
                let (buffer, base) = self.access_indices(access)?;
                let mut lanes = Vec::with_capacity(ty.num_elements() as usize);
                for point in vector_points(&base, &ty.shape) {
                    lanes.push(self.read(access.memref, buffer, &point)?);
                }
                self.set_result(id, RtValue::Vector(lanes));
            }
            OpKind::VectorStore { value, access } => {
                let lanes = match self.get(*value)? {
                    RtValue::Vector(lanes) => lanes.clone(),
                    other => return Err(InterpError::TypeError(format!("cannot vector-store {:?}", other))),
                };
                let (buffer, base) = self.access_indices(access)?;
                let shape = match func.value_type(*value) {
                    IrType::Vector(v) => v.shape.clone(),
                    other => return Err(InterpError::TypeError(format!("{} is not a vector type", other))),
                };
                for (point, lane) in vector_points(&base, &shape).into_iter().zip(lanes) {
                    self.write(access.memref, buffer, &point, lane)?;
                }
            }
            OpKind::Broadcast { value, ty } => {
                let scalar = match self.get(*value)? {
                    RtValue::Scalar(s) => *s,
                    other => return Err(InterpError::TypeError(format!("cannot broadcast {:?}", other))),
                };
                self.set_result(id, RtValue::Vector(vec![scalar; ty.num_elements() as usize]));
            }
            OpKind::Alloc { ty } => {
                let state = BufferState::new(BufferRef::Alloc(self.allocs), ty.clone())?;
                self.allocs += 1;
                self.buffers.push(state);
                self.set_result(id, RtValue::Buffer(self.buffers.len() - 1));
            }
            OpKind::Dealloc { memref } => {
                let buffer = self.buffer_index(*memref)?;
                self.buffers[buffer].freed = true;
            }
            OpKind::DmaStart { src, dst, tag, shape } => {
                let (src_buffer, src_base) = self.access_indices(src)?;
                let (dst_buffer, dst_base) = self.access_indices(dst)?;
                self.access_indices(tag)?;
                for point in box_points(shape) {
                    let s: Vec<i64> = src_base.iter().zip(&point).map(|(b, p)| b + p).collect();
                    let d: Vec<i64> = dst_base.iter().zip(&point).map(|(b, p)| b + p).collect();
                    if self.buffers[src_buffer].offset(&s).is_none() || self.buffers[dst_buffer].offset(&d).is_none() {
                        continue;
                    }
                    let value = self.read(src.memref, src_buffer, &s)?;
                    self.write(dst.memref, dst_buffer, &d, value)?;
                }
            }
            OpKind::DmaWait { tag, .. } => {
                self.access_indices(tag)?;
            }
            OpKind::Call { .. } => {}
            OpKind::Return { .. } => return Ok(Flow::Return),
        }
        Ok(Flow::Continue)
    }
}

fn binary(op: BinaryOp, a: Scalar, b: Scalar) -> Result<Scalar, InterpError> {
    Ok(match (a, b) {
        (Scalar::Int(x), Scalar::Int(y)) => Scalar::Int(match op {
            BinaryOp::Add => x.wrapping_add(y),
            BinaryOp::Sub => x.wrapping_sub(y),
            BinaryOp::Mul => x.wrapping_mul(y),
            BinaryOp::Div => x.checked_div(y).ok_or(InterpError::DivisionByZero)?,
            BinaryOp::Rem => x.checked_rem(y).ok_or(InterpError::DivisionByZero)?,
        }),
        (Scalar::Float(x), Scalar::Float(y)) => Scalar::Float(match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Rem => x % y,
        }),
        (a, b) => return Err(InterpError::TypeError(format!("mixed operands {} and {}", a, b))),
    })
}

/// Every point of a box with the given shape, row-major.
fn box_points(shape: &[i64]) -> Vec<Vec<i64>> {
    let mut points = vec![Vec::new()];
    for &extent in shape {
        points = points
            .into_iter()
            .flat_map(|p| {
                (0..extent.max(0)).map(move |i| {
                    let mut q = p.clone();
                    q.push(i);
                    q
                })
            })
            .collect();
    }
    points
}

/// Indices covered by a vector of `shape` anchored at `base`; the vector
/// spans the trailing dimensions.
fn vector_points(base: &[i64], shape: &[i64]) -> Vec<Vec<i64>> {
    let lead = base.len().saturating_sub(shape.len());
    box_points(shape)
        .into_iter()
        .map(|offsets| {
            let mut point = base.to_vec();
            for (k, o) in offsets.into_iter().enumerate() {
                point[lead + k] += o;
            }
            point
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::{AffineExpr, AffineMap};
    use crate::ir::{ElementType, MemRefType, OpBuilder};

    fn ints(values: &[i64]) -> Vec<Scalar> {
        values.iter().map(|&v| Scalar::Int(v)).collect()
    }

    #[test]
    fn test_prefix_sum() {
        // for i in 1..8: A[i] = A[i - 1] + A[i]
        let mut func = Function::new("scan", vec![IrType::MemRef(MemRefType::new(vec![8], ElementType::I64))]);
        let a = func.arguments[0];
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(1, 8, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, l.body);
        let prev = b.load(a, AffineMap::new(1, 0, vec![AffineExpr::dim(0) - 1]), vec![l.iv]);
        let cur = b.load(a, AffineMap::identity(1), vec![l.iv]);
        let sum = b.add(prev, cur);
        let store = b.store(sum, a, AffineMap::identity(1), vec![l.iv]);

        let exec = run(&func, vec![ArgValue::Buffer(ints(&[1; 8]))]).unwrap();
        assert_eq!(exec.buffers[0], ints(&[1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(exec.count(store), 7);
        assert_eq!(exec.trace.len(), 21);
    }

    #[test]
    fn test_out_of_bounds_is_reported() {
        let mut func = Function::new("oob", vec![IrType::MemRef(MemRefType::new(vec![4], ElementType::I32))]);
        let a = func.arguments[0];
        let body = func.body;
        let mut b = OpBuilder::at_end(&mut func, body);
        let c = b.constant_index(4);
        b.load(a, AffineMap::identity(1), vec![c]);
        let err = run(&func, vec![ArgValue::Buffer(ints(&[0; 4]))]).unwrap_err();
        assert_eq!(
            err,
            InterpError::OutOfBounds {
                memref: a,
                indices: vec![4]
            }
        );
    }

    #[test]
    fn test_layout_physical_shape() {
        let transposed = AffineMap::new(2, 0, vec![AffineExpr::dim(1), AffineExpr::dim(0)]);
        let ty = MemRefType::new(vec![2, 3], ElementType::I32).with_layout(transposed);
        assert_eq!(physical_shape(&ty).unwrap(), vec![3, 2]);
        let state = BufferState::new(BufferRef::Alloc(0), ty).unwrap();
        assert_eq!(state.offset(&[1, 2]), Some(5));
        assert_eq!(state.offset(&[0, 1]), Some(2));
        assert_eq!(state.offset(&[2, 0]), None);
    }

    #[test]
    fn test_dma_clips_to_bounds() {
        let mut func = Function::new(
            "dma",
            vec![IrType::MemRef(MemRefType::new(vec![6], ElementType::I32))],
        );
        let src = func.arguments[0];
        let body = func.body;
        let mut b = OpBuilder::at_end(&mut func, body);
        let fast = b.alloc(MemRefType::new(vec![4], ElementType::I32).with_memory_space(1));
        let tag = b.alloc(MemRefType::new(vec![1], ElementType::I32));
        let zero = b.constant_index(0);
        let four = b.constant_index(4);
        let at = |memref, v| Access {
            memref,
            map: AffineMap::identity(1),
            operands: vec![v],
        };
        b.dma_start(at(src, four), at(fast, zero), at(tag, zero), vec![4]);
        b.dma_wait(at(tag, zero), 4);
        let exec = run(&func, vec![ArgValue::Buffer(ints(&[0, 1, 2, 3, 4, 5]))]).unwrap();
        // Only src[4] and src[5] exist.
        let writes: Vec<_> = exec.trace.iter().filter(|e| e.is_write).collect();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].value, Scalar::Int(5));
    }
}
