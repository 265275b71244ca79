//! Functions
//!
//! A function owns an arena of operations, blocks and values addressed by
//! [`OpId`], [`BlockId`] and [`ValueId`]. Loop and conditional bodies are
//! blocks whose `parent_op` is the owning operation, so the body forms a tree
//! rooted at `Function::body`. Erasing an operation tombstones it and every
//! operation nested under it; handles to erased nodes are never reused.

use super::ops::{AffineBound, Attribute, LoopOp, OpKind, Operation};
use super::types::IrType;
use super::{BlockId, OpId, ValueId};
use crate::affine::IntegerSet;
use fxhash::FxHashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Where a value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueDef {
    Argument(usize),
    Result { op: OpId, index: usize },
    InductionVar(OpId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueData {
    pub ty: IrType,
    pub def: ValueDef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub parent_op: Option<OpId>,
    pub ops: Vec<OpId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub arguments: Vec<ValueId>,
    pub body: BlockId,
    ops: Vec<Option<Operation>>,
    blocks: Vec<Option<Block>>,
    values: Vec<ValueData>,
}

impl Function {
    pub fn new(name: impl Into<String>, argument_types: Vec<IrType>) -> Self {
        let mut func = Self {
            name: name.into(),
            arguments: Vec::new(),
            body: BlockId(0),
            ops: Vec::new(),
            blocks: vec![Some(Block::default())],
            values: Vec::new(),
        };
        for (i, ty) in argument_types.into_iter().enumerate() {
            let v = func.new_value(ty, ValueDef::Argument(i));
            func.arguments.push(v);
        }
        func
    }

    // === Arena access ===

    pub fn op(&self, id: OpId) -> &Operation {
        self.ops[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("access to erased operation {}", id))
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Operation {
        self.ops[id.0 as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("access to erased operation {}", id))
    }

    pub fn try_op(&self, id: OpId) -> Option<&Operation> {
        self.ops.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn is_live(&self, id: OpId) -> bool {
        self.try_op(id).is_some()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        self.blocks[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("access to erased block {}", id))
    }

    fn block_mut(&mut self, id: BlockId) -> &mut Block {
        self.blocks[id.0 as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("access to erased block {}", id))
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.0 as usize]
    }

    pub fn value_type(&self, id: ValueId) -> &IrType {
        &self.value(id).ty
    }

    pub fn set_value_type(&mut self, id: ValueId, ty: IrType) {
        self.values[id.0 as usize].ty = ty;
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    fn new_value(&mut self, ty: IrType, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData { ty, def });
        id
    }

    fn new_block(&mut self, parent_op: OpId) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Some(Block {
            parent_op: Some(parent_op),
            ops: Vec::new(),
        }));
        id
    }

    // === Mutation ===

    /// Insert an operation at `index` of `block` and create its results.
    pub fn insert_op(&mut self, block: BlockId, index: usize, kind: OpKind, result_types: Vec<IrType>) -> OpId {
        let id = OpId(self.ops.len() as u32);
        let results: SmallVec<[ValueId; 1]> = result_types
            .into_iter()
            .enumerate()
            .map(|(i, ty)| self.new_value(ty, ValueDef::Result { op: id, index: i }))
            .collect();
        self.ops.push(Some(Operation {
            kind,
            results,
            attributes: IndexMap::new(),
            parent: block,
        }));
        self.block_mut(block).ops.insert(index, id);
        id
    }

    /// Insert a loop with an empty body.
    pub fn insert_loop(&mut self, block: BlockId, index: usize, lower: AffineBound, upper: AffineBound, step: i64) -> OpId {
        let id = OpId(self.ops.len() as u32);
        let body = self.new_block(id);
        let iv = self.new_value(IrType::index(), ValueDef::InductionVar(id));
        self.ops.push(Some(Operation {
            kind: OpKind::For(LoopOp {
                lower,
                upper,
                step,
                iv,
                body,
                parallel: false,
            }),
            results: SmallVec::new(),
            attributes: IndexMap::new(),
            parent: block,
        }));
        self.block_mut(block).ops.insert(index, id);
        id
    }

    /// Insert a conditional with an empty then-block (and else-block).
    pub fn insert_if(&mut self, block: BlockId, index: usize, set: IntegerSet, operands: Vec<ValueId>, with_else: bool) -> OpId {
        let id = OpId(self.ops.len() as u32);
        let then_block = self.new_block(id);
        let else_block = with_else.then(|| self.new_block(id));
        self.ops.push(Some(Operation {
            kind: OpKind::If {
                set,
                operands,
                then_block,
                else_block,
            },
            results: SmallVec::new(),
            attributes: IndexMap::new(),
            parent: block,
        }));
        self.block_mut(block).ops.insert(index, id);
        id
    }

    /// Erase an operation together with everything nested under it.
    pub fn erase_op(&mut self, id: OpId) {
        let parent = self.op(id).parent;
        self.block_mut(parent).ops.retain(|&o| o != id);
        self.tombstone(id);
    }

    fn tombstone(&mut self, id: OpId) {
        let Some(op) = self.ops[id.0 as usize].take() else {
            return;
        };
        for block in op.kind.nested_blocks() {
            if let Some(b) = self.blocks[block.0 as usize].take() {
                for nested in b.ops {
                    self.tombstone(nested);
                }
            }
        }
    }

    /// Move an operation to `index` of `block`. The index is interpreted
    /// after the operation has been detached from its current block.
    pub fn move_op(&mut self, id: OpId, block: BlockId, index: usize) {
        let parent = self.op(id).parent;
        self.block_mut(parent).ops.retain(|&o| o != id);
        self.block_mut(block).ops.insert(index, id);
        self.op_mut(id).parent = block;
    }

    /// Move an operation right before `anchor`.
    pub fn move_op_before(&mut self, id: OpId, anchor: OpId) {
        let parent = self.op(id).parent;
        self.block_mut(parent).ops.retain(|&o| o != id);
        let block = self.op(anchor).parent;
        let index = self.position_in_block(anchor);
        self.block_mut(block).ops.insert(index, id);
        self.op_mut(id).parent = block;
    }

    /// Move every operation of `from` to the end of `to`.
    pub fn splice_block(&mut self, from: BlockId, to: BlockId) {
        let ops = std::mem::take(&mut self.block_mut(from).ops);
        for &op in &ops {
            self.op_mut(op).parent = to;
        }
        self.block_mut(to).ops.extend(ops);
    }

    /// Replace every use of `old` with `new` in live operations.
    pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) {
        for op in self.ops.iter_mut().flatten() {
            op.kind.for_each_operand_mut(|v| {
                if *v == old {
                    *v = new;
                }
            });
        }
    }

    /// Replace uses of `old` with `new` only inside operations nested
    /// (at any depth) in `block`.
    pub fn replace_uses_in_block(&mut self, block: BlockId, old: ValueId, new: ValueId) {
        for op in self.walk_block(block) {
            self.op_mut(op).kind.for_each_operand_mut(|v| {
                if *v == old {
                    *v = new;
                }
            });
        }
    }

    /// Live operations using `value`.
    pub fn uses(&self, value: ValueId) -> Vec<OpId> {
        let mut users = Vec::new();
        for (i, op) in self.ops.iter().enumerate() {
            if let Some(op) = op {
                let mut used = false;
                op.kind.for_each_operand(|v| used |= v == value);
                if used {
                    users.push(OpId(i as u32));
                }
            }
        }
        users
    }

    pub fn has_uses(&self, value: ValueId) -> bool {
        !self.uses(value).is_empty()
    }

    /// Deep-copy `op` to `index` of `block`. Operands found in `mapping` are
    /// remapped; results, induction variables and nested blocks are fresh and
    /// recorded in `mapping`.
    pub fn clone_op_into(&mut self, op: OpId, block: BlockId, index: usize, mapping: &mut FxHashMap<ValueId, ValueId>) -> OpId {
        let source = self.op(op).clone();
        let mut kind = source.kind.clone();
        kind.for_each_operand_mut(|v| {
            if let Some(&mapped) = mapping.get(v) {
                *v = mapped;
            }
        });
        let new_id = match kind {
            OpKind::For(l) => {
                let id = self.insert_loop(block, index, l.lower, l.upper, l.step);
                let (new_iv, new_body) = {
                    let nl = self.loop_op_mut(id);
                    nl.parallel = l.parallel;
                    (nl.iv, nl.body)
                };
                mapping.insert(l.iv, new_iv);
                let body_ops = self.block(l.body).ops.clone();
                for (i, nested) in body_ops.into_iter().enumerate() {
                    self.clone_op_into(nested, new_body, i, mapping);
                }
                id
            }
            OpKind::If {
                set,
                operands,
                then_block,
                else_block,
            } => {
                let id = self.insert_if(block, index, set, operands, else_block.is_some());
                let (new_then, new_else) = match &self.op(id).kind {
                    OpKind::If {
                        then_block, else_block, ..
                    } => (*then_block, *else_block),
                    _ => unreachable!(),
                };
                let pairs = [(Some(then_block), Some(new_then)), (else_block, new_else)];
                for (from, to) in pairs {
                    if let (Some(from), Some(to)) = (from, to) {
                        let ops = self.block(from).ops.clone();
                        for (i, nested) in ops.into_iter().enumerate() {
                            self.clone_op_into(nested, to, i, mapping);
                        }
                    }
                }
                id
            }
            other => {
                let types = source.results.iter().map(|&r| self.value_type(r).clone()).collect();
                let id = self.insert_op(block, index, other, types);
                let new_results = self.op(id).results.clone();
                for (old, new) in source.results.iter().zip(new_results) {
                    mapping.insert(*old, new);
                }
                id
            }
        };
        self.op_mut(new_id).attributes = source.attributes;
        new_id
    }

    // === Queries ===

    pub fn loop_op(&self, id: OpId) -> Option<&LoopOp> {
        self.try_op(id).and_then(|op| op.kind.as_loop())
    }

    /// Panics if `id` is not a loop.
    pub fn loop_op_mut(&mut self, id: OpId) -> &mut LoopOp {
        match &mut self.op_mut(id).kind {
            OpKind::For(l) => l,
            other => panic!("{} is not a loop", other.name()),
        }
    }

    pub fn is_loop(&self, id: OpId) -> bool {
        self.loop_op(id).is_some()
    }

    pub fn set_attr(&mut self, id: OpId, key: &str, value: Attribute) {
        self.op_mut(id).set_attr(key, value);
    }

    /// Operation owning the block that holds `op`.
    pub fn parent_op(&self, op: OpId) -> Option<OpId> {
        self.block(self.op(op).parent).parent_op
    }

    pub fn position_in_block(&self, op: OpId) -> usize {
        let block = self.op(op).parent;
        self.block(block)
            .ops
            .iter()
            .position(|&o| o == op)
            .unwrap_or_else(|| panic!("{} missing from its parent block", op))
    }

    /// Loops enclosing `op`, outermost first.
    pub fn enclosing_loops(&self, op: OpId) -> Vec<OpId> {
        let mut loops = Vec::new();
        let mut cur = self.parent_op(op);
        while let Some(p) = cur {
            if self.is_loop(p) {
                loops.push(p);
            }
            cur = self.parent_op(p);
        }
        loops.reverse();
        loops
    }

    /// True if `op` is nested (at any depth) inside `ancestor`.
    pub fn is_ancestor(&self, ancestor: OpId, op: OpId) -> bool {
        let mut cur = self.parent_op(op);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.parent_op(p);
        }
        false
    }

    /// Operation defining a value (the loop for an induction variable).
    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        match self.value(value).def {
            ValueDef::Argument(_) => None,
            ValueDef::Result { op, .. } | ValueDef::InductionVar(op) => Some(op),
        }
    }

    pub fn is_induction_var(&self, value: ValueId) -> bool {
        matches!(self.value(value).def, ValueDef::InductionVar(_))
    }

    /// True if `value` is available on entry to `region_op`, i.e. it is not
    /// defined by `region_op` or anything nested in it.
    pub fn is_defined_outside(&self, value: ValueId, region_op: OpId) -> bool {
        match self.defining_op(value) {
            None => true,
            Some(def) => def != region_op && !self.is_ancestor(region_op, def),
        }
    }

    /// True if `value` is a function argument or a result of an operation
    /// sitting directly in the function body.
    pub fn is_top_level_value(&self, value: ValueId) -> bool {
        match self.value(value).def {
            ValueDef::Argument(_) => true,
            ValueDef::Result { op, .. } => self.op(op).parent == self.body,
            ValueDef::InductionVar(_) => false,
        }
    }

    /// Whether `a` executes before `b` on every path reaching `b`: `a` sits
    /// in a block enclosing `b` and precedes `b`'s ancestor in that block.
    pub fn properly_dominates(&self, a: OpId, b: OpId) -> bool {
        if a == b {
            return false;
        }
        let block_a = self.op(a).parent;
        let mut cur = b;
        loop {
            if self.op(cur).parent == block_a {
                return self.position_in_block(a) < self.position_in_block(cur);
            }
            match self.parent_op(cur) {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }

    // === Walks ===

    /// Pre-order walk of every operation nested in `block`.
    pub fn walk_block(&self, block: BlockId) -> Vec<OpId> {
        let mut out = Vec::new();
        self.walk_into(block, &mut out, false);
        out
    }

    /// Post-order walk (children before parents) of operations in `block`.
    pub fn walk_block_post_order(&self, block: BlockId) -> Vec<OpId> {
        let mut out = Vec::new();
        self.walk_into(block, &mut out, true);
        out
    }

    fn walk_into(&self, block: BlockId, out: &mut Vec<OpId>, post_order: bool) {
        for &op in &self.block(block).ops {
            if !post_order {
                out.push(op);
            }
            for nested in self.op(op).kind.nested_blocks() {
                self.walk_into(nested, out, post_order);
            }
            if post_order {
                out.push(op);
            }
        }
    }

    /// Pre-order walk of the whole function.
    pub fn walk(&self) -> Vec<OpId> {
        self.walk_block(self.body)
    }

    /// Pre-order walk of the operations nested inside `op`.
    pub fn walk_nested(&self, op: OpId) -> Vec<OpId> {
        let mut out = Vec::new();
        for block in self.op(op).kind.nested_blocks() {
            self.walk_into(block, &mut out, false);
        }
        out
    }

    /// Every loop of the function, pre-order.
    pub fn loops(&self) -> Vec<OpId> {
        self.walk().into_iter().filter(|&op| self.is_loop(op)).collect()
    }

    /// Every loop of the function, innermost first.
    pub fn loops_post_order(&self) -> Vec<OpId> {
        self.walk_block_post_order(self.body)
            .into_iter()
            .filter(|&op| self.is_loop(op))
            .collect()
    }

    fn fmt_block(&self, f: &mut fmt::Formatter<'_>, block: BlockId, indent: usize) -> fmt::Result {
        for &op in &self.block(block).ops {
            self.fmt_op(f, op, indent)?;
        }
        Ok(())
    }

    fn fmt_op(&self, f: &mut fmt::Formatter<'_>, id: OpId, indent: usize) -> fmt::Result {
        let op = self.op(id);
        let pad = "  ".repeat(indent);
        let list = |vs: &[ValueId]| vs.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
        write!(f, "{}", pad)?;
        if !op.results.is_empty() {
            write!(f, "{} = ", list(&op.results))?;
        }
        match &op.kind {
            OpKind::For(l) => {
                writeln!(
                    f,
                    "for {} = max {}({}) to min {}({}) step {}{} {{",
                    l.iv,
                    l.lower.map,
                    list(&l.lower.operands),
                    l.upper.map,
                    list(&l.upper.operands),
                    l.step,
                    if l.parallel { " parallel" } else { "" }
                )?;
                self.fmt_block(f, l.body, indent + 1)?;
                writeln!(f, "{}}}", pad)
            }
            OpKind::If {
                set,
                operands,
                then_block,
                else_block,
            } => {
                writeln!(f, "if {}({}) {{", set, list(operands))?;
                self.fmt_block(f, *then_block, indent + 1)?;
                if let Some(else_block) = else_block {
                    writeln!(f, "{}}} else {{", pad)?;
                    self.fmt_block(f, *else_block, indent + 1)?;
                }
                writeln!(f, "{}}}", pad)
            }
            OpKind::Constant(lit) => writeln!(f, "constant {:?}", lit),
            OpKind::Alloc { ty } => writeln!(f, "alloc : {}", ty),
            kind => {
                write!(f, "{} {}", kind.name(), list(&kind.operands()))?;
                for (map, _) in kind.maps() {
                    write!(f, " {}", map)?;
                }
                writeln!(f)
            }
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self
            .arguments
            .iter()
            .map(|&a| format!("{}: {}", a, self.value_type(a)))
            .collect();
        writeln!(f, "func {}({}) {{", self.name, args.join(", "))?;
        self.fmt_block(f, self.body, 1)?;
        writeln!(f, "}}")
    }
}

/// A collection of functions in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IrModule {
    pub functions: IndexMap<String, Function>,
}

impl IrModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, func: Function) {
        self.functions.insert(func.name.clone(), func);
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.get_mut(name)
    }
}
