//! Loop Tiling
//!
//! Tiles every maximal perfect band rooted at an outermost loop. Each band
//! loop is strip-mined into a tile loop stepping by `step * T` and a point
//! loop covering one tile; the tile loops are placed outermost in their
//! original order, followed by the point loops. Point loops are bounded by
//! `min(tile_iv + step * T, ub)`, so partial tiles need no epilogue.

use super::{verify, AffinePass, ConfigError, OptimizationResult, PassError};
use crate::affine::{AffineExpr, AffineMap};
use crate::analysis::access::footprint_bytes;
use crate::analysis::dependence::dependences_in;
use crate::analysis::loops::{
    annotate_trip_count, band_roots, bound_is_invariant, constant_trip_count, largest_divisor_at_most,
    loop_depth, perfect_band,
};
use crate::ir::{AffineBound, Function, OpId};
use fxhash::FxHashMap;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

/// Tile size used when nothing better is known.
pub const DEFAULT_TILE_SIZE: i64 = 4;

/// Cache capacity assumed when none is configured.
pub const DEFAULT_CACHE_SIZE_BYTES: u64 = 512 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct TilingOptions {
    /// Capacity the tile footprint should fit in
    pub cache_size_bytes: u64,
    /// Uniform tile size for every band dimension
    pub tile_size: Option<i64>,
    /// Per-dimension tile sizes, outermost first; missing entries use the
    /// default tile size
    pub tile_sizes: Vec<i64>,
    /// Shrink tile sizes to divisors of constant trip counts
    pub avoid_max_min_bounds: bool,
}

impl Default for TilingOptions {
    fn default() -> Self {
        Self {
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            tile_size: None,
            tile_sizes: Vec::new(),
            avoid_max_min_bounds: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopTiling {
    options: TilingOptions,
}

impl LoopTiling {
    pub fn new(options: TilingOptions) -> Result<Self, ConfigError> {
        if options.cache_size_bytes == 0 {
            return Err(ConfigError::NonPositiveFactor {
                option: "cacheSizeBytes",
                value: 0,
            });
        }
        if let Some(t) = options.tile_size {
            if t <= 0 {
                return Err(ConfigError::NonPositiveFactor {
                    option: "tileSize",
                    value: t,
                });
            }
        }
        if let Some(&t) = options.tile_sizes.iter().find(|&&t| t <= 0) {
            return Err(ConfigError::NonPositiveFactor {
                option: "tileSizes",
                value: t,
            });
        }
        Ok(Self { options })
    }

    /// Uniform tile size for every dimension.
    pub fn with_tile_size(tile_size: i64) -> Result<Self, ConfigError> {
        Self::new(TilingOptions {
            tile_size: Some(tile_size),
            ..TilingOptions::default()
        })
    }

    pub fn options(&self) -> &TilingOptions {
        &self.options
    }

    /// Tile sizes for `band`, or `None` when the band should stay as is.
    fn tile_sizes(&self, func: &Function, band: &[OpId]) -> Option<Vec<i64>> {
        let n = band.len();
        let mut sizes = if let Some(t) = self.options.tile_size {
            vec![t; n]
        } else if !self.options.tile_sizes.is_empty() {
            let mut sizes = self.options.tile_sizes.clone();
            sizes.resize(n, DEFAULT_TILE_SIZE);
            sizes
        } else {
            self.cache_derived_sizes(func, band)?
        };
        if self.options.avoid_max_min_bounds {
            for (size, &lp) in sizes.iter_mut().zip(band) {
                if let Some(tc) = constant_trip_count(func, lp).filter(|&tc| tc > 0) {
                    *size = largest_divisor_at_most(tc, *size as u64) as i64;
                }
            }
        }
        Some(sizes)
    }

    /// Split the band so that one tile's footprint fits the cache.
    fn cache_derived_sizes(&self, func: &Function, band: &[OpId]) -> Option<Vec<i64>> {
        let n = band.len();
        let trip_counts: Option<Vec<u64>> = band.iter().map(|&l| constant_trip_count(func, l)).collect();
        let (Some(footprint), Some(trip_counts)) = (footprint_bytes(func, band[0]), trip_counts) else {
            return Some(vec![DEFAULT_TILE_SIZE; n]);
        };
        let cache = self.options.cache_size_bytes;
        let excess = footprint.div_ceil(cache);
        if excess <= 1 {
            debug!("band at {} fits in cache ({} bytes)", band[0], footprint);
            return None;
        }
        // Smallest f with f^n >= excess.
        let mut f = 1u64;
        while f.checked_pow(n as u32).is_some_and(|p| p < excess) {
            f += 1;
        }
        Some(trip_counts.iter().map(|&tc| ((tc / f) as i64).max(1)).collect())
    }
}

impl AffinePass for LoopTiling {
    fn name(&self) -> &'static str {
        "affine-loop-tile"
    }

    fn run_on_function(&self, func: &mut Function) -> Result<OptimizationResult, PassError> {
        verify(func)?;
        let mut tiled = 0;
        for root in band_roots(func) {
            let band = perfect_band(func, root);
            if !is_hyper_rectangular(func, &band) {
                debug!("band at {} is not hyper-rectangular", root);
                continue;
            }
            let Some(sizes) = self.tile_sizes(func, &band) else {
                continue;
            };
            if !is_tiling_valid(func, &band) {
                debug!("tiling band at {} would violate a dependence", root);
                continue;
            }
            tile_perfect_band(func, &band, &sizes);
            tiled += 1;
        }
        let mut result = OptimizationResult::unchanged();
        result.record("bands_tiled", tiled);
        if tiled > 0 {
            info!("tiled {} bands in {}", tiled, func.name);
        }
        Ok(result)
    }
}

/// Bounds of every band loop are available outside the band.
fn is_hyper_rectangular(func: &Function, band: &[OpId]) -> bool {
    band.iter().all(|&lp| {
        func.loop_op(lp).is_some_and(|l| {
            bound_is_invariant(func, &l.lower, band[0]) && bound_is_invariant(func, &l.upper, band[0])
        })
    })
}

/// Tiling permutes iterations across the band dimensions; it is legal when
/// no dependence has a negative component on a band loop.
pub fn is_tiling_valid(func: &Function, band: &[OpId]) -> bool {
    let depth = loop_depth(func, band[0]);
    let Some(deps) = dependences_in(func, band[0], depth + 1..=depth + band.len() + 1) else {
        return false;
    };
    deps.iter().all(|(_, _, components)| {
        components
            .iter()
            .skip(depth)
            .take(band.len())
            .all(|c| c.is_non_negative())
    })
}

/// Tile a perfect band with the given sizes. Returns the new loops, tile
/// loops first.
pub fn tile_perfect_band(func: &mut Function, band: &[OpId], sizes: &[i64]) -> Vec<OpId> {
    let root = band[0];
    let originals: Vec<_> = band.iter().filter_map(|&l| func.loop_op(l).cloned()).collect();
    let block = func.op(root).parent;
    let mut index = func.position_in_block(root);
    let mut target = block;
    let mut new_loops = Vec::with_capacity(2 * band.len());

    let mut tile_ivs = Vec::with_capacity(band.len());
    for (l, &t) in originals.iter().zip(sizes) {
        let lp = func.insert_loop(target, index, l.lower.clone(), l.upper.clone(), l.step * t);
        annotate_trip_count(func, lp);
        let nl = func.loop_op_mut(lp);
        tile_ivs.push(nl.iv);
        target = nl.body;
        index = 0;
        new_loops.push(lp);
    }

    let mut mapping = FxHashMap::default();
    for (k, (l, &t)) in originals.iter().zip(sizes).enumerate() {
        let tile_iv = tile_ivs[k];
        let lower = AffineBound {
            map: AffineMap::identity(1),
            operands: vec![tile_iv],
        };
        let span = l.step * t;
        let divides = constant_trip_count(func, band[k]).is_some_and(|tc| tc % t as u64 == 0);
        let upper = if divides {
            AffineBound {
                map: AffineMap::new(1, 0, vec![AffineExpr::dim(0) + span]),
                operands: vec![tile_iv],
            }
        } else {
            let ub = &l.upper.map;
            let mut results = vec![AffineExpr::dim(0) + span];
            results.extend(ub.results.iter().map(|e| e.shift_dims(1)));
            let mut operands = vec![tile_iv];
            operands.extend(l.upper.operands.iter().copied());
            AffineBound {
                map: AffineMap::new(ub.num_dims + 1, ub.num_symbols, results),
                operands,
            }
        };
        let lp = func.insert_loop(target, 0, lower, upper, l.step);
        annotate_trip_count(func, lp);
        let nl = func.loop_op(lp).cloned();
        if let Some(nl) = nl {
            mapping.insert(l.iv, nl.iv);
            target = nl.body;
        }
        new_loops.push(lp);
    }

    let innermost_body = originals[originals.len() - 1].body;
    func.splice_block(innermost_body, target);
    for (&old, &new) in &mapping {
        func.replace_uses_in_block(target, old, new);
    }
    func.erase_op(root);
    trace!("tiled band at {} with sizes {:?}", root, sizes);
    new_loops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElementType, IrType, MemRefType, OpBuilder};

    fn copy_nest(n: i64, m: i64) -> (Function, OpId) {
        let ty = IrType::MemRef(MemRefType::new(vec![n, m], ElementType::F32));
        let mut func = Function::new("f", vec![ty.clone(), ty]);
        let (a, b_arg) = (func.arguments[0], func.arguments[1]);
        let body = func.body;
        let outer = OpBuilder::at_end(&mut func, body).constant_for(0, n, 1);
        let ob = func.loop_op(outer).unwrap().clone();
        let inner = OpBuilder::at_end(&mut func, ob.body).constant_for(0, m, 1);
        let il = func.loop_op(inner).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, il.body);
        let v = b.load(b_arg, AffineMap::identity(2), vec![ob.iv, il.iv]);
        b.store(v, a, AffineMap::identity(2), vec![ob.iv, il.iv]);
        (func, outer)
    }

    #[test]
    fn test_partial_tiles_use_min_bound() {
        let (mut func, _) = copy_nest(10, 8);
        let pass = LoopTiling::new(TilingOptions {
            tile_size: Some(4),
            avoid_max_min_bounds: false,
            ..TilingOptions::default()
        })
        .unwrap();
        assert!(pass.run_on_function(&mut func).unwrap().modified);
        let loops = func.loops();
        assert_eq!(loops.len(), 4);
        let point_i = func.loop_op(loops[2]).unwrap();
        assert_eq!(point_i.upper.map.num_results(), 2);
        let point_j = func.loop_op(loops[3]).unwrap();
        assert_eq!(point_j.upper.map.num_results(), 1);
        assert_eq!(constant_trip_count(&func, loops[0]), Some(3));
        assert_eq!(constant_trip_count(&func, loops[1]), Some(2));
    }

    #[test]
    fn test_avoid_max_min_shrinks_to_divisor() {
        let (mut func, _) = copy_nest(10, 8);
        let pass = LoopTiling::with_tile_size(4).unwrap();
        pass.run_on_function(&mut func).unwrap();
        let loops = func.loops();
        // 10 is tiled by 2, 8 by 4.
        assert_eq!(func.loop_op(loops[0]).unwrap().step, 2);
        assert_eq!(func.loop_op(loops[1]).unwrap().step, 4);
        assert!(loops.iter().all(|&l| func.loop_op(l).unwrap().upper.map.num_results() == 1));
    }

    #[test]
    fn test_fitting_band_untouched_by_cache_heuristic() {
        let (mut func, _) = copy_nest(16, 16);
        let pass = LoopTiling::default();
        assert!(!pass.run_on_function(&mut func).unwrap().modified);
    }

    #[test]
    fn test_cache_heuristic_splits_band() {
        // Two 64x64 f32 arrays: 32 KiB against a 4 KiB cache, excess 8,
        // so each dimension is split in 3 (3^2 >= 8).
        let (mut func, _) = copy_nest(64, 64);
        let pass = LoopTiling::new(TilingOptions {
            cache_size_bytes: 4096,
            avoid_max_min_bounds: false,
            ..TilingOptions::default()
        })
        .unwrap();
        assert!(pass.run_on_function(&mut func).unwrap().modified);
        let loops = func.loops();
        assert_eq!(func.loop_op(loops[0]).unwrap().step, 21);
    }

    #[test]
    fn test_negative_dependence_blocks_tiling() {
        // A[i][j] = A[i-1][j+1] has distance (1, -1).
        let ty = IrType::MemRef(MemRefType::new(vec![16, 16], ElementType::F32));
        let mut func = Function::new("f", vec![ty]);
        let a = func.arguments[0];
        let body = func.body;
        let outer = OpBuilder::at_end(&mut func, body).constant_for(1, 16, 1);
        let ob = func.loop_op(outer).unwrap().clone();
        let inner = OpBuilder::at_end(&mut func, ob.body).constant_for(0, 15, 1);
        let il = func.loop_op(inner).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, il.body);
        let map = AffineMap::new(2, 0, vec![AffineExpr::dim(0) - 1, AffineExpr::dim(1) + 1]);
        let v = b.load(a, map, vec![ob.iv, il.iv]);
        b.store(v, a, AffineMap::identity(2), vec![ob.iv, il.iv]);

        let pass = LoopTiling::with_tile_size(4).unwrap();
        assert!(!pass.run_on_function(&mut func).unwrap().modified);
        assert_eq!(func.loops(), vec![outer, inner]);
    }

    #[test]
    fn test_rejects_zero_tile_size() {
        assert!(matches!(
            LoopTiling::with_tile_size(0),
            Err(ConfigError::NonPositiveFactor { option: "tileSize", .. })
        ));
    }
}
