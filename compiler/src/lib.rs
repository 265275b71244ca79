//! Affine loop-nest transformations
//!
//! A small structured IR of loops, conditionals and affine memory accesses
//! ([`ir`]), the integer-set machinery to reason about it ([`affine`]),
//! loop, access-region and dependence analyses ([`analysis`]), and the
//! passes that rewrite loop nests ([`transforms`]): tiling, unrolling,
//! unroll-and-jam, data copy generation, scalar replacement,
//! vectorization, invariant code motion, parallelism detection,
//! normalization and simplification.

pub mod affine;
pub mod analysis;
pub mod ir;
pub mod logging;
pub mod transforms;

pub use transforms::{AffinePass, ConfigError, OptimizationResult, PassError, PassManager, PassRegistry};
