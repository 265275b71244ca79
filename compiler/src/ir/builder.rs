//! Operation Builder
//!
//! A cursor into a block of a [`Function`]. Every `build`-style method
//! inserts at the cursor and advances past the new operation, so a sequence
//! of calls emits operations in program order.

use tracing::trace;

use super::function::Function;
use super::ops::{Access, AffineBound, BinaryOp, Literal, OpKind};
use super::types::{ElementType, IrType, MemRefType, VectorType};
use super::{BlockId, OpId, ValueId};
use crate::affine::{AffineMap, IntegerSet};

pub struct OpBuilder<'a> {
    func: &'a mut Function,
    block: BlockId,
    index: usize,
}

impl<'a> OpBuilder<'a> {
    /// Position at the end of `block`.
    pub fn at_end(func: &'a mut Function, block: BlockId) -> Self {
        let index = func.block(block).ops.len();
        Self { func, block, index }
    }

    /// Position at the start of `block`.
    pub fn at_start(func: &'a mut Function, block: BlockId) -> Self {
        Self { func, block, index: 0 }
    }

    /// Position right before `op`.
    pub fn before(func: &'a mut Function, op: OpId) -> Self {
        let block = func.op(op).parent;
        let index = func.position_in_block(op);
        Self { func, block, index }
    }

    /// Position right after `op`.
    pub fn after(func: &'a mut Function, op: OpId) -> Self {
        let block = func.op(op).parent;
        let index = func.position_in_block(op) + 1;
        Self { func, block, index }
    }

    pub fn func(&mut self) -> &mut Function {
        self.func
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    fn insert(&mut self, kind: OpKind, result_types: Vec<IrType>) -> OpId {
        trace!(op = kind.name(), block = %self.block, index = self.index, "insert");
        let id = self.func.insert_op(self.block, self.index, kind, result_types);
        self.index += 1;
        id
    }

    fn insert_value(&mut self, kind: OpKind, ty: IrType) -> ValueId {
        let id = self.insert(kind, vec![ty]);
        self.func.op(id).results[0]
    }

    // === Scalars ===

    pub fn constant_index(&mut self, value: i64) -> ValueId {
        self.insert_value(OpKind::Constant(Literal::Int(value)), IrType::index())
    }

    pub fn constant_int(&mut self, value: i64, ty: ElementType) -> ValueId {
        self.insert_value(OpKind::Constant(Literal::Int(value)), IrType::Scalar(ty))
    }

    pub fn constant_float(&mut self, value: f64, ty: ElementType) -> ValueId {
        self.insert_value(OpKind::Constant(Literal::Float(value)), IrType::Scalar(ty))
    }

    /// Result type follows the left operand.
    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.func.value_type(lhs).clone();
        self.insert_value(OpKind::Binary { op, lhs, rhs }, ty)
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn apply(&mut self, map: AffineMap, operands: Vec<ValueId>) -> ValueId {
        self.insert_value(OpKind::Apply { map, operands }, IrType::index())
    }

    // === Structured control flow ===

    pub fn for_loop(&mut self, lower: AffineBound, upper: AffineBound, step: i64) -> OpId {
        let id = self.func.insert_loop(self.block, self.index, lower, upper, step);
        self.index += 1;
        id
    }

    /// `for %iv = lb to ub step step` with constant bounds.
    pub fn constant_for(&mut self, lb: i64, ub: i64, step: i64) -> OpId {
        self.for_loop(AffineBound::constant(lb), AffineBound::constant(ub), step)
    }

    pub fn if_op(&mut self, set: IntegerSet, operands: Vec<ValueId>, with_else: bool) -> OpId {
        let id = self.func.insert_if(self.block, self.index, set, operands, with_else);
        self.index += 1;
        id
    }

    // === Memory ===

    pub fn load(&mut self, memref: ValueId, map: AffineMap, operands: Vec<ValueId>) -> ValueId {
        let element = self.func.value_type(memref).element();
        self.insert_value(
            OpKind::Load(Access {
                memref,
                map,
                operands,
            }),
            IrType::Scalar(element),
        )
    }

    pub fn store(&mut self, value: ValueId, memref: ValueId, map: AffineMap, operands: Vec<ValueId>) -> OpId {
        self.insert(
            OpKind::Store {
                value,
                access: Access {
                    memref,
                    map,
                    operands,
                },
            },
            Vec::new(),
        )
    }

    pub fn vector_load(&mut self, memref: ValueId, map: AffineMap, operands: Vec<ValueId>, ty: VectorType) -> ValueId {
        let access = Access {
            memref,
            map,
            operands,
        };
        self.insert_value(
            OpKind::VectorLoad {
                access,
                ty: ty.clone(),
            },
            IrType::Vector(ty),
        )
    }

    pub fn vector_store(&mut self, value: ValueId, memref: ValueId, map: AffineMap, operands: Vec<ValueId>) -> OpId {
        self.insert(
            OpKind::VectorStore {
                value,
                access: Access {
                    memref,
                    map,
                    operands,
                },
            },
            Vec::new(),
        )
    }

    pub fn broadcast(&mut self, value: ValueId, ty: VectorType) -> ValueId {
        self.insert_value(OpKind::Broadcast { value, ty: ty.clone() }, IrType::Vector(ty))
    }

    pub fn alloc(&mut self, ty: MemRefType) -> ValueId {
        self.insert_value(OpKind::Alloc { ty: ty.clone() }, IrType::MemRef(ty))
    }

    pub fn dealloc(&mut self, memref: ValueId) -> OpId {
        self.insert(OpKind::Dealloc { memref }, Vec::new())
    }

    pub fn dma_start(&mut self, src: Access, dst: Access, tag: Access, shape: Vec<i64>) -> OpId {
        self.insert(OpKind::DmaStart { src, dst, tag, shape }, Vec::new())
    }

    pub fn dma_wait(&mut self, tag: Access, num_elements: i64) -> OpId {
        self.insert(OpKind::DmaWait { tag, num_elements }, Vec::new())
    }

    // === Other ===

    pub fn call(&mut self, callee: impl Into<String>, args: Vec<ValueId>) -> OpId {
        self.insert(
            OpKind::Call {
                callee: callee.into(),
                args,
            },
            Vec::new(),
        )
    }

    pub fn ret(&mut self, values: Vec<ValueId>) -> OpId {
        self.insert(OpKind::Return { values }, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::AffineMap;

    #[test]
    fn test_build_loop_nest() {
        let mut func = Function::new(
            "copy",
            vec![
                IrType::MemRef(MemRefType::new(vec![8], ElementType::F32)),
                IrType::MemRef(MemRefType::new(vec![8], ElementType::F32)),
            ],
        );
        let (a, b) = (func.arguments[0], func.arguments[1]);
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(0, 8, 1);
        let (iv, loop_body) = {
            let l = func.loop_op(lp).unwrap();
            (l.iv, l.body)
        };
        let mut b_in = OpBuilder::at_end(&mut func, loop_body);
        let v = b_in.load(a, AffineMap::identity(1), vec![iv]);
        b_in.store(v, b, AffineMap::identity(1), vec![iv]);

        assert_eq!(func.walk().len(), 3);
        assert_eq!(func.loops(), vec![lp]);
        assert_eq!(*func.value_type(v), IrType::Scalar(ElementType::F32));
        let ops = func.block(loop_body).ops.clone();
        assert!(func.properly_dominates(ops[0], ops[1]));
        assert!(!func.properly_dominates(ops[1], ops[0]));
        assert_eq!(func.enclosing_loops(ops[1]), vec![lp]);
    }

    #[test]
    fn test_insert_before_and_after() {
        let mut func = Function::new("f", vec![]);
        let body = func.body;
        let mut b = OpBuilder::at_end(&mut func, body);
        let c1 = b.constant_index(1);
        let c2 = b.constant_index(2);
        let op2 = func.defining_op(c2).unwrap();
        let mid = OpBuilder::before(&mut func, op2).constant_index(7);
        let last = OpBuilder::after(&mut func, op2).constant_index(9);
        let order: Vec<ValueId> = func
            .walk()
            .into_iter()
            .map(|op| func.op(op).results[0])
            .collect();
        assert_eq!(order, vec![c1, mid, c2, last]);
    }
}
