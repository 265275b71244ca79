//! Affine algebra: expressions, maps, integer sets and flat constraint
//! systems.

pub mod expr;
pub mod flat;
pub mod map;
pub mod set;

pub use expr::{AffineExpr, Flattener, LinearForm, LocalDiv, NotAffine};
pub use flat::{FlatAffineConstraints, VarKind};
pub use map::AffineMap;
pub use set::IntegerSet;
