//! IR Type System
//!
//! Scalar element types, memrefs (statically shaped buffers with an optional
//! layout map and a memory space) and fixed-shape vectors.

use crate::affine::AffineMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    I32,
    I64,
    F32,
    F64,
    /// Machine index (loop counters, subscripts)
    Index,
}

impl ElementType {
    /// Size in bytes of one element.
    pub fn size_bytes(self) -> u64 {
        match self {
            ElementType::I32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::F64 | ElementType::Index => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }

    pub fn is_integer(self) -> bool {
        !self.is_float()
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::Index => "index",
        };
        write!(f, "{}", name)
    }
}

/// Statically shaped buffer type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemRefType {
    pub shape: Vec<i64>,
    pub element: ElementType,
    /// Logical-to-physical index map; `None` is the identity layout.
    pub layout: Option<AffineMap>,
    pub memory_space: u32,
}

impl MemRefType {
    pub fn new(shape: Vec<i64>, element: ElementType) -> Self {
        Self {
            shape,
            element,
            layout: None,
            memory_space: 0,
        }
    }

    pub fn with_memory_space(mut self, memory_space: u32) -> Self {
        self.memory_space = memory_space;
        self
    }

    pub fn with_layout(mut self, layout: AffineMap) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> i64 {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> u64 {
        self.num_elements().max(0) as u64 * self.element.size_bytes()
    }

    /// True when the layout is absent or is the identity map.
    pub fn has_identity_layout(&self) -> bool {
        self.layout.as_ref().map_or(true, AffineMap::is_identity)
    }
}

impl fmt::Display for MemRefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memref<")?;
        for dim in &self.shape {
            write!(f, "{}x", dim)?;
        }
        write!(f, "{}", self.element)?;
        if let Some(layout) = &self.layout {
            write!(f, ", {}", layout)?;
        }
        if self.memory_space != 0 {
            write!(f, ", {}", self.memory_space)?;
        }
        write!(f, ">")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorType {
    pub shape: Vec<i64>,
    pub element: ElementType,
}

impl VectorType {
    pub fn new(shape: Vec<i64>, element: ElementType) -> Self {
        Self { shape, element }
    }

    pub fn num_elements(&self) -> i64 {
        self.shape.iter().product()
    }
}

impl fmt::Display for VectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vector<")?;
        for dim in &self.shape {
            write!(f, "{}x", dim)?;
        }
        write!(f, "{}>", self.element)
    }
}

/// Type of an SSA value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IrType {
    Scalar(ElementType),
    MemRef(MemRefType),
    Vector(VectorType),
}

impl IrType {
    pub fn index() -> Self {
        IrType::Scalar(ElementType::Index)
    }

    pub fn as_memref(&self) -> Option<&MemRefType> {
        match self {
            IrType::MemRef(m) => Some(m),
            _ => None,
        }
    }

    pub fn element(&self) -> ElementType {
        match self {
            IrType::Scalar(e) => *e,
            IrType::MemRef(m) => m.element,
            IrType::Vector(v) => v.element,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, IrType::Scalar(ElementType::Index))
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Scalar(e) => write!(f, "{}", e),
            IrType::MemRef(m) => write!(f, "{}", m),
            IrType::Vector(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memref_sizes() {
        let ty = MemRefType::new(vec![16, 32], ElementType::F32);
        assert_eq!(ty.num_elements(), 512);
        assert_eq!(ty.size_bytes(), 2048);
        assert!(ty.has_identity_layout());
        assert_eq!(ty.to_string(), "memref<16x32xf32>");
    }

    #[test]
    fn test_layout_display() {
        let transposed = AffineMap::new(
            2,
            0,
            vec![crate::affine::AffineExpr::dim(1), crate::affine::AffineExpr::dim(0)],
        );
        let ty = MemRefType::new(vec![4, 8], ElementType::I64)
            .with_layout(transposed)
            .with_memory_space(1);
        assert!(!ty.has_identity_layout());
        assert_eq!(ty.to_string(), "memref<4x8xi64, (d0, d1) -> (d1, d0), 1>");
    }
}
