//! Operations
//!
//! The operation set covers exactly what the affine passes read and produce:
//! scalar arithmetic, `apply`, structured `for`/`if`, affine loads/stores
//! (scalar and vector), buffer management, DMA transfers, opaque calls and
//! returns.

use super::types::{MemRefType, VectorType};
use super::{BlockId, ValueId};
use crate::affine::{AffineMap, IntegerSet};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Attribute key recording a statically known trip count on a loop.
pub const TRIP_COUNT_ATTR: &str = "trip_count";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Rem => "rem",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
}

/// Affine access: `memref[map(operands)]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Access {
    pub memref: ValueId,
    pub map: AffineMap,
    pub operands: Vec<ValueId>,
}

/// Loop bound: `map(operands)`. A lower bound is the max of the results,
/// an upper bound the min.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffineBound {
    pub map: AffineMap,
    pub operands: Vec<ValueId>,
}

impl AffineBound {
    pub fn constant(value: i64) -> Self {
        Self {
            map: AffineMap::constant(value),
            operands: Vec::new(),
        }
    }

    pub fn as_constant(&self) -> Option<i64> {
        self.map.single_constant_result()
    }
}

/// `for %iv = max(lower) to min(upper) step step { body }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopOp {
    pub lower: AffineBound,
    pub upper: AffineBound,
    pub step: i64,
    pub iv: ValueId,
    pub body: BlockId,
    pub parallel: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Constant(Literal),
    Binary {
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    /// Single-result affine map application producing an index.
    Apply {
        map: AffineMap,
        operands: Vec<ValueId>,
    },
    For(LoopOp),
    If {
        set: IntegerSet,
        operands: Vec<ValueId>,
        then_block: BlockId,
        else_block: Option<BlockId>,
    },
    Load(Access),
    Store {
        value: ValueId,
        access: Access,
    },
    VectorLoad {
        access: Access,
        ty: VectorType,
    },
    VectorStore {
        value: ValueId,
        access: Access,
    },
    Broadcast {
        value: ValueId,
        ty: VectorType,
    },
    Alloc {
        ty: MemRefType,
    },
    Dealloc {
        memref: ValueId,
    },
    /// Asynchronous copy of a `shape`-sized box from `src` to `dst`,
    /// signalling completion through `tag`.
    DmaStart {
        src: Access,
        dst: Access,
        tag: Access,
        shape: Vec<i64>,
    },
    DmaWait {
        tag: Access,
        num_elements: i64,
    },
    /// Opaque call; treated as reading and writing every memref argument.
    Call {
        callee: String,
        args: Vec<ValueId>,
    },
    Return {
        values: Vec<ValueId>,
    },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Constant(_) => "constant",
            OpKind::Binary { op, .. } => op.name(),
            OpKind::Apply { .. } => "apply",
            OpKind::For(_) => "for",
            OpKind::If { .. } => "if",
            OpKind::Load(_) => "load",
            OpKind::Store { .. } => "store",
            OpKind::VectorLoad { .. } => "vector_load",
            OpKind::VectorStore { .. } => "vector_store",
            OpKind::Broadcast { .. } => "broadcast",
            OpKind::Alloc { .. } => "alloc",
            OpKind::Dealloc { .. } => "dealloc",
            OpKind::DmaStart { .. } => "dma_start",
            OpKind::DmaWait { .. } => "dma_wait",
            OpKind::Call { .. } => "call",
            OpKind::Return { .. } => "return",
        }
    }

    /// Visit every value operand, including map operands and memrefs.
    pub fn for_each_operand(&self, mut f: impl FnMut(ValueId)) {
        fn access(a: &Access, f: &mut dyn FnMut(ValueId)) {
            f(a.memref);
            a.operands.iter().for_each(|&v| f(v));
        }
        match self {
            OpKind::Constant(_) | OpKind::Alloc { .. } => {}
            OpKind::Binary { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            OpKind::Apply { operands, .. } | OpKind::If { operands, .. } => operands.iter().for_each(|&v| f(v)),
            OpKind::For(l) => {
                l.lower.operands.iter().for_each(|&v| f(v));
                l.upper.operands.iter().for_each(|&v| f(v));
            }
            OpKind::Load(a) | OpKind::VectorLoad { access: a, .. } => access(a, &mut f),
            OpKind::Store { value, access: a } | OpKind::VectorStore { value, access: a } => {
                f(*value);
                access(a, &mut f);
            }
            OpKind::Broadcast { value, .. } => f(*value),
            OpKind::Dealloc { memref } => f(*memref),
            OpKind::DmaStart { src, dst, tag, .. } => {
                access(src, &mut f);
                access(dst, &mut f);
                access(tag, &mut f);
            }
            OpKind::DmaWait { tag, .. } => access(tag, &mut f),
            OpKind::Call { args, .. } => args.iter().for_each(|&v| f(v)),
            OpKind::Return { values } => values.iter().for_each(|&v| f(v)),
        }
    }

    pub fn operands(&self) -> Vec<ValueId> {
        let mut out = Vec::new();
        self.for_each_operand(|v| out.push(v));
        out
    }

    /// Mutable visit of every value operand.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut ValueId)) {
        fn access(a: &mut Access, f: &mut dyn FnMut(&mut ValueId)) {
            f(&mut a.memref);
            a.operands.iter_mut().for_each(|v| f(v));
        }
        match self {
            OpKind::Constant(_) | OpKind::Alloc { .. } => {}
            OpKind::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            OpKind::Apply { operands, .. } | OpKind::If { operands, .. } => operands.iter_mut().for_each(|v| f(v)),
            OpKind::For(l) => {
                l.lower.operands.iter_mut().for_each(|v| f(v));
                l.upper.operands.iter_mut().for_each(|v| f(v));
            }
            OpKind::Load(a) | OpKind::VectorLoad { access: a, .. } => access(a, &mut f),
            OpKind::Store { value, access: a } | OpKind::VectorStore { value, access: a } => {
                f(value);
                access(a, &mut f);
            }
            OpKind::Broadcast { value, .. } => f(value),
            OpKind::Dealloc { memref } => f(memref),
            OpKind::DmaStart { src, dst, tag, .. } => {
                access(src, &mut f);
                access(dst, &mut f);
                access(tag, &mut f);
            }
            OpKind::DmaWait { tag, .. } => access(tag, &mut f),
            OpKind::Call { args, .. } => args.iter_mut().for_each(|v| f(v)),
            OpKind::Return { values } => values.iter_mut().for_each(|v| f(v)),
        }
    }

    /// Every affine map carried by the operation, with the number of
    /// operands supplied for it.
    pub fn maps(&self) -> Vec<(&AffineMap, usize)> {
        match self {
            OpKind::Apply { map, operands } => vec![(map, operands.len())],
            OpKind::For(l) => vec![
                (&l.lower.map, l.lower.operands.len()),
                (&l.upper.map, l.upper.operands.len()),
            ],
            OpKind::Load(a)
            | OpKind::VectorLoad { access: a, .. }
            | OpKind::Store { access: a, .. }
            | OpKind::VectorStore { access: a, .. } => vec![(&a.map, a.operands.len())],
            OpKind::DmaStart { src, dst, tag, .. } => vec![
                (&src.map, src.operands.len()),
                (&dst.map, dst.operands.len()),
                (&tag.map, tag.operands.len()),
            ],
            OpKind::DmaWait { tag, .. } => vec![(&tag.map, tag.operands.len())],
            _ => Vec::new(),
        }
    }

    /// Mutable visit of every affine map.
    pub fn for_each_map_mut(&mut self, mut f: impl FnMut(&mut AffineMap)) {
        match self {
            OpKind::Apply { map, .. } => f(map),
            OpKind::For(l) => {
                f(&mut l.lower.map);
                f(&mut l.upper.map);
            }
            OpKind::Load(a)
            | OpKind::VectorLoad { access: a, .. }
            | OpKind::Store { access: a, .. }
            | OpKind::VectorStore { access: a, .. } => f(&mut a.map),
            OpKind::DmaStart { src, dst, tag, .. } => {
                f(&mut src.map);
                f(&mut dst.map);
                f(&mut tag.map);
            }
            OpKind::DmaWait { tag, .. } => f(&mut tag.map),
            _ => {}
        }
    }

    /// Blocks nested directly under this operation.
    pub fn nested_blocks(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            OpKind::For(l) => smallvec::smallvec![l.body],
            OpKind::If {
                then_block, else_block, ..
            } => {
                let mut blocks = smallvec::smallvec![*then_block];
                blocks.extend(*else_block);
                blocks
            }
            _ => SmallVec::new(),
        }
    }

    /// Whether executing the operation can be observed beyond its results.
    /// Nested regions are not inspected.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            OpKind::Store { .. }
                | OpKind::VectorStore { .. }
                | OpKind::Alloc { .. }
                | OpKind::Dealloc { .. }
                | OpKind::DmaStart { .. }
                | OpKind::DmaWait { .. }
                | OpKind::Call { .. }
                | OpKind::Return { .. }
        )
    }

    /// The access of a (scalar or vector) load or store.
    pub fn access(&self) -> Option<&Access> {
        match self {
            OpKind::Load(a)
            | OpKind::VectorLoad { access: a, .. }
            | OpKind::Store { access: a, .. }
            | OpKind::VectorStore { access: a, .. } => Some(a),
            _ => None,
        }
    }

    pub fn access_mut(&mut self) -> Option<&mut Access> {
        match self {
            OpKind::Load(a)
            | OpKind::VectorLoad { access: a, .. }
            | OpKind::Store { access: a, .. }
            | OpKind::VectorStore { access: a, .. } => Some(a),
            _ => None,
        }
    }

    pub fn is_store(&self) -> bool {
        matches!(self, OpKind::Store { .. } | OpKind::VectorStore { .. })
    }

    pub fn is_load(&self) -> bool {
        matches!(self, OpKind::Load(_) | OpKind::VectorLoad { .. })
    }

    pub fn as_loop(&self) -> Option<&LoopOp> {
        match self {
            OpKind::For(l) => Some(l),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Int(i64),
    Bool(bool),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub results: SmallVec<[ValueId; 1]>,
    pub attributes: IndexMap<String, Attribute>,
    /// Block holding this operation.
    pub parent: BlockId,
}

impl Operation {
    pub fn result(&self) -> Option<ValueId> {
        self.results.first().copied()
    }

    pub fn attr_int(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(Attribute::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set_attr(&mut self, key: &str, value: Attribute) {
        self.attributes.insert(key.to_string(), value);
    }
}
