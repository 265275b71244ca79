//! Affine Intermediate Representation
//!
//! A small structured IR: functions own arenas of operations, blocks and
//! values. Loops (`for`) and conditionals (`if`) nest blocks, so control flow
//! is a tree and dominance follows block nesting and program order.

pub mod builder;
pub mod function;
pub mod interp;
pub mod ops;
pub mod types;
pub mod validation;

pub use builder::OpBuilder;
pub use function::{Block, Function, IrModule, ValueData, ValueDef};
pub use ops::{Access, AffineBound, Attribute, BinaryOp, Literal, LoopOp, OpKind, Operation, TRIP_COUNT_ATTR};
pub use types::{ElementType, IrType, MemRefType, VectorType};

use serde::{Deserialize, Serialize};
use std::fmt;

/// SSA value handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Operation handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u32);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Block handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}
