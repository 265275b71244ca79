//! Loop and Memory Analysis
//!
//! Everything the transformations ask about a function: composed access
//! maps, loop trip counts and bands, access regions and dependences.

pub mod access;
pub mod dependence;
pub mod loops;
pub mod value_map;

pub use access::{collect_accesses, footprint_bytes, may_alias, memref_regions, MemRefAccess, MemRegion, RegionBox, RegionSummary, SymbolicBound};
pub use dependence::{check_memref_access_dependence, dependences_in, DependenceComponent, DependenceResult, Direction};
pub use loops::{constant_trip_count, perfect_band, promote_if_single_iteration, trip_count_map};
pub use value_map::{resolve_by_id, unify_operands, AffineValueMap};
