//! Data Copy Generation
//!
//! Promotes the regions of slow-memory buffers accessed in a loop to
//! freshly allocated fast-memory buffers. The box covering every access of
//! a buffer is copied in before the loop, copied back out after it when the
//! loop writes, and the accesses inside the loop are rebased onto the fast
//! buffer. Loops are visited outermost first; a buffer whose box does not
//! fit the remaining fast-memory capacity is reconsidered in the nested
//! loops, and left alone if it never fits.
//!
//! Copies are DMA transfers signalled through a tag buffer when the box is
//! at least `min_dma_transfer_size` bytes, and pointwise copy nests clamped
//! to the buffer shape otherwise.

use super::{verify, AffinePass, ConfigError, OptimizationResult, PassError};
use crate::affine::{AffineExpr, AffineMap};
use crate::analysis::access::{memref_regions, MemRefAccess, MemRegion, RegionBox, RegionSummary};
use crate::analysis::loops::{band_roots, bound_is_invariant, constant_trip_count, loop_depth};
use crate::ir::{Access, AffineBound, ElementType, Function, MemRefType, OpBuilder, OpId, OpKind, ValueId};
use fxhash::FxHashSet;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct DataCopyOptions {
    pub slow_memory_space: u32,
    pub fast_memory_space: u32,
    /// Memory space of the DMA completion tags
    pub tag_memory_space: u32,
    /// Smallest box, in bytes, copied with a DMA transfer
    pub min_dma_transfer_size: u64,
    pub fast_mem_capacity_bytes: u64,
    /// Use DMA transfers at all; pointwise copies otherwise
    pub generate_dma: bool,
}

impl Default for DataCopyOptions {
    fn default() -> Self {
        Self {
            slow_memory_space: 0,
            fast_memory_space: 1,
            tag_memory_space: 0,
            min_dma_transfer_size: 1024,
            fast_mem_capacity_bytes: u64::MAX,
            generate_dma: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AffineDataCopyGeneration {
    options: DataCopyOptions,
}

/// What one run produced.
#[derive(Debug, Default)]
struct CopyStats {
    promoted: usize,
    dma_transfers: usize,
    pointwise_copies: usize,
}

impl AffineDataCopyGeneration {
    pub fn new(options: DataCopyOptions) -> Result<Self, ConfigError> {
        if options.slow_memory_space == options.fast_memory_space {
            return Err(ConfigError::InvalidOptions {
                pass: "affine-data-copy-generate".to_string(),
                message: format!("slow and fast memory spaces are both {}", options.slow_memory_space),
            });
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &DataCopyOptions {
        &self.options
    }

    /// Promote what fits in `available` bytes at `lp`, then retry the rest
    /// in the loops directly nested in it.
    fn copy_for_loop(
        &self,
        func: &mut Function,
        lp: OpId,
        available: u64,
        candidates: Option<&FxHashSet<ValueId>>,
        stats: &mut CopyStats,
    ) {
        let regions = match memref_regions(func, lp) {
            Ok(regions) => regions,
            Err(_) => {
                debug!("regions of {} are not affine; trying nested loops", lp);
                for child in child_loops(func, lp) {
                    self.copy_for_loop(func, child, available, candidates, stats);
                }
                return;
            }
        };

        let mut available = available;
        let mut deferred = FxHashSet::default();
        for (memref, summary) in regions {
            if candidates.is_some_and(|c| !c.contains(&memref)) || !self.is_promotable(func, lp, memref) {
                continue;
            }
            let Some(ty) = func.value_type(memref).as_memref().cloned() else {
                continue;
            };
            let bytes = summary.bounding_box.size_bytes(&ty);
            if bytes > available {
                debug!(
                    "{}: box of {} needs {} bytes, {} available; deferring",
                    lp, memref, bytes, available
                );
                deferred.insert(memref);
                continue;
            }
            self.promote(func, lp, memref, &ty, &summary, stats);
            available -= bytes;
        }

        if !deferred.is_empty() {
            for child in child_loops(func, lp) {
                self.copy_for_loop(func, child, available, Some(&deferred), stats);
            }
        }
    }

    /// Slow-memory buffers defined outside `lp` that nothing in `lp` hands
    /// to a call or a DMA.
    fn is_promotable(&self, func: &Function, lp: OpId, memref: ValueId) -> bool {
        let Some(ty) = func.value_type(memref).as_memref() else {
            return false;
        };
        if ty.memory_space != self.options.slow_memory_space || ty.rank() == 0 || !func.is_defined_outside(memref, lp) {
            return false;
        }
        !func.walk_nested(lp).into_iter().any(|op| match &func.op(op).kind {
            OpKind::Call { args, .. } => args.contains(&memref),
            OpKind::DmaStart { src, dst, .. } => src.memref == memref || dst.memref == memref,
            OpKind::Dealloc { memref: m } => *m == memref,
            _ => false,
        })
    }

    fn promote(
        &self,
        func: &mut Function,
        lp: OpId,
        memref: ValueId,
        ty: &MemRefType,
        summary: &RegionSummary,
        stats: &mut CopyStats,
    ) {
        let bbox = &summary.bounding_box;
        let (lower_map, lower_operands) = box_origin(bbox);
        let fast_ty = MemRefType::new(bbox.extents.clone(), ty.element).with_memory_space(self.options.fast_memory_space);
        let fast = OpBuilder::before(func, lp).alloc(fast_ty);

        let copy_in = summary.has_read || (summary.has_write && !is_fully_overwritten(func, lp, summary));
        let use_dma = self.options.generate_dma && bbox.size_bytes(ty) >= self.options.min_dma_transfer_size;
        let copy = BoxCopy {
            slow: memref,
            fast,
            lower_map: &lower_map,
            lower_operands: &lower_operands,
            bbox,
        };

        let mut tag = None;
        if use_dma {
            let tag_ty = MemRefType::new(vec![1], ElementType::I32).with_memory_space(self.options.tag_memory_space);
            tag = Some(OpBuilder::before(func, lp).alloc(tag_ty));
        }
        if copy_in {
            match tag {
                Some(tag) => copy.emit_dma(&mut OpBuilder::before(func, lp), tag, true),
                None => copy.emit_pointwise(&mut OpBuilder::before(func, lp), true),
            }
        }

        let mut after = OpBuilder::after(func, lp);
        if summary.has_write {
            match tag {
                Some(tag) => copy.emit_dma(&mut after, tag, false),
                None => copy.emit_pointwise(&mut after, false),
            }
        }
        after.dealloc(fast);
        if let Some(tag) = tag {
            after.dealloc(tag);
        }

        for &op in &summary.accesses {
            rebase_access(func, op, fast, &lower_map, &lower_operands);
        }

        trace!(
            "promoted {} at {} to {:?} ({}copy-in, {}copy-out, {})",
            memref,
            lp,
            bbox.extents,
            if copy_in { "" } else { "no " },
            if summary.has_write { "" } else { "no " },
            if use_dma { "dma" } else { "pointwise" }
        );
        stats.promoted += 1;
        let transfers = copy_in as usize + summary.has_write as usize;
        if use_dma {
            stats.dma_transfers += transfers;
        } else {
            stats.pointwise_copies += transfers;
        }
    }
}

impl AffinePass for AffineDataCopyGeneration {
    fn name(&self) -> &'static str {
        "affine-data-copy-generate"
    }

    fn run_on_function(&self, func: &mut Function) -> Result<OptimizationResult, PassError> {
        verify(func)?;
        let mut stats = CopyStats::default();
        for root in band_roots(func) {
            self.copy_for_loop(func, root, self.options.fast_mem_capacity_bytes, None, &mut stats);
        }
        let mut result = OptimizationResult::unchanged();
        result.record("buffers_promoted", stats.promoted);
        result.record("dma_transfers", stats.dma_transfers);
        result.record("pointwise_copies", stats.pointwise_copies);
        if stats.promoted > 0 {
            info!("promoted {} buffers to fast memory in {}", stats.promoted, func.name);
        }
        Ok(result)
    }
}

/// Loops whose nearest enclosing loop is `lp`.
fn child_loops(func: &Function, lp: OpId) -> Vec<OpId> {
    func.walk_nested(lp)
        .into_iter()
        .filter(|&op| func.is_loop(op) && func.enclosing_loops(op).last() == Some(&lp))
        .collect()
}

/// The box's lower corner as a zero-dimensional map over symbols.
fn box_origin(bbox: &RegionBox) -> (AffineMap, Vec<ValueId>) {
    let mut results = Vec::with_capacity(bbox.lower.len());
    let mut operands = Vec::new();
    for bound in &bbox.lower {
        let (expr, ops) = bound.to_map();
        results.push(expr.shift_symbols(operands.len() as u32));
        operands.extend(ops);
    }
    (AffineMap::new(0, operands.len() as u32, results), operands)
}

/// Point an access at `fast`, subtracting the box origin from every index.
fn rebase_access(func: &mut Function, op: OpId, fast: ValueId, lower_map: &AffineMap, lower_operands: &[ValueId]) {
    let Some(access) = func.op_mut(op).kind.access_mut() else {
        return;
    };
    let num_symbols = access.map.num_symbols;
    let results = access
        .map
        .results
        .iter()
        .zip(&lower_map.results)
        .map(|(index, lower)| index.clone() - lower.shift_symbols(num_symbols))
        .collect();
    access.map = AffineMap::new(
        access.map.num_dims,
        num_symbols + lower_operands.len() as u32,
        results,
    )
    .simplify();
    access.memref = fast;
    access.operands.extend_from_slice(lower_operands);
}

/// Whether some unconditional scalar store in `lp` writes every element of
/// the box: each index is a distinct unit-step induction variable of a
/// rectangular nest below `lp` plus an offset, and the store's own box is
/// the whole box.
fn is_fully_overwritten(func: &Function, lp: OpId, summary: &RegionSummary) -> bool {
    summary.accesses.iter().any(|&op| {
        MemRefAccess::from_op(func, op)
            .filter(|a| a.is_store && a.vector_shape.is_none())
            .is_some_and(|a| store_covers_box(func, lp, &a, &summary.bounding_box))
    })
}

fn store_covers_box(func: &Function, lp: OpId, access: &MemRefAccess, bbox: &RegionBox) -> bool {
    let mut parent = func.parent_op(access.op);
    while let Some(p) = parent {
        if !func.is_loop(p) {
            return false;
        }
        if p == lp {
            break;
        }
        parent = func.parent_op(p);
    }
    let nest: Vec<OpId> = func
        .enclosing_loops(access.op)
        .into_iter()
        .skip_while(|&l| l != lp)
        .collect();
    let rectangular = nest.iter().all(|&l| {
        func.loop_op(l).is_some_and(|lo| {
            lo.step == 1
                && lo.lower.map.num_results() == 1
                && lo.upper.map.num_results() == 1
                && bound_is_invariant(func, &lo.lower, lp)
                && bound_is_invariant(func, &lo.upper, lp)
                && constant_trip_count(func, l).is_some_and(|tc| tc >= 1)
        })
    });
    if !rectangular {
        return false;
    }

    let Ok(vm) = access.value_map(func) else {
        return false;
    };
    let Ok((forms, _)) = vm.map.flatten() else {
        return false;
    };
    let nest_ivs: FxHashSet<ValueId> = nest.iter().filter_map(|&l| func.loop_op(l).map(|lo| lo.iv)).collect();
    let mut seen = FxHashSet::default();
    for form in &forms {
        if form.has_locals() {
            return false;
        }
        let used: Vec<usize> = (0..form.dims.len()).filter(|&d| form.dims[d] != 0).collect();
        let [dim] = used.as_slice() else {
            return false;
        };
        let iv = vm.dim_values()[*dim];
        if form.dims[*dim] != 1 || !nest_ivs.contains(&iv) || !seen.insert(iv) {
            return false;
        }
    }

    let Some(ty) = func.value_type(access.memref).as_memref() else {
        return false;
    };
    MemRegion::compute(func, access, loop_depth(func, lp))
        .ok()
        .and_then(|region| region.bounding_box(ty))
        .is_some_and(|own| own == *bbox)
}

/// One box transfer between a slow buffer and its fast copy.
struct BoxCopy<'a> {
    slow: ValueId,
    fast: ValueId,
    lower_map: &'a AffineMap,
    lower_operands: &'a [ValueId],
    bbox: &'a RegionBox,
}

impl BoxCopy<'_> {
    fn slow_origin(&self) -> Access {
        Access {
            memref: self.slow,
            map: self.lower_map.clone(),
            operands: self.lower_operands.to_vec(),
        }
    }

    fn fast_origin(&self) -> Access {
        Access {
            memref: self.fast,
            map: AffineMap::new(0, 0, vec![AffineExpr::constant(0); self.bbox.extents.len()]),
            operands: Vec::new(),
        }
    }

    /// `dma_start` of the whole box followed by its `dma_wait`.
    fn emit_dma(&self, b: &mut OpBuilder<'_>, tag: ValueId, inbound: bool) {
        let tag_access = Access {
            memref: tag,
            map: AffineMap::constant(0),
            operands: Vec::new(),
        };
        let (src, dst) = if inbound {
            (self.slow_origin(), self.fast_origin())
        } else {
            (self.fast_origin(), self.slow_origin())
        };
        b.dma_start(src, dst, tag_access.clone(), self.bbox.extents.clone());
        b.dma_wait(tag_access, self.bbox.num_elements());
    }

    /// Copy nest over `max(lower, 0) .. min(lower + extent, shape)` per
    /// dimension.
    fn emit_pointwise(&self, b: &mut OpBuilder<'_>, inbound: bool) {
        let rank = self.bbox.extents.len();
        let num_symbols = self.lower_operands.len() as u32;
        let mut ivs = Vec::with_capacity(rank);
        let outermost = self.copy_loop(b, 0, num_symbols);
        let func = b.func();
        let Some(mut body) = func.loop_op(outermost).map(|l| {
            ivs.push(l.iv);
            l.body
        }) else {
            return;
        };
        for k in 1..rank {
            let lp = self.copy_loop(&mut OpBuilder::at_end(func, body), k, num_symbols);
            let Some(l) = func.loop_op(lp) else {
                return;
            };
            ivs.push(l.iv);
            body = l.body;
        }

        let mut inner = OpBuilder::at_end(func, body);
        let mut operands = ivs.clone();
        operands.extend_from_slice(self.lower_operands);
        let slow_map = AffineMap::new(rank as u32, num_symbols, (0..rank as u32).map(AffineExpr::dim).collect());
        let fast_map = AffineMap::new(
            rank as u32,
            num_symbols,
            (0..rank)
                .map(|k| (AffineExpr::dim(k as u32) - self.lower_map.results[k].clone()).simplify())
                .collect(),
        );
        let (src, src_map, dst, dst_map) = if inbound {
            (self.slow, slow_map, self.fast, fast_map)
        } else {
            (self.fast, fast_map, self.slow, slow_map)
        };
        let value = inner.load(src, src_map, operands.clone());
        inner.store(value, dst, dst_map, operands);
    }

    fn copy_loop(&self, b: &mut OpBuilder<'_>, k: usize, num_symbols: u32) -> OpId {
        let lower = self.lower_map.results[k].clone();
        let lower_bound = AffineBound {
            map: AffineMap::new(0, num_symbols, vec![lower.clone(), AffineExpr::constant(0)]),
            operands: self.lower_operands.to_vec(),
        };
        let upper_bound = AffineBound {
            map: AffineMap::new(
                0,
                num_symbols,
                vec![
                    (lower + self.bbox.extents[k]).simplify(),
                    AffineExpr::constant(self.bbox.shape[k]),
                ],
            ),
            operands: self.lower_operands.to_vec(),
        };
        b.for_loop(lower_bound, upper_bound, 1)
    }
}
