//! Per-tier kernel families.
//!
//! A `KernelSet` bundles the four operations the engines need: packing,
//! staging, the micro-kernel and the epilogue. SIMD families hold a
//! `ReferenceKernels` and forward whatever they do not specialize to it.

use std::fmt;
use std::sync::Arc;

use crate::kernels::epilogue::QuantizationContext;
use crate::kernels::micro::{MicroKernelFn, MAX_LANES, MAX_ROWS, REFERENCE_TABLE};
use crate::kernels::pack::{pack_weight, PackedWeight, WeightLayout};
use crate::kernels::plan::BlockPlan;
use crate::kernels::staging::{stage_patch, PatchSource};
use crate::kernels::tier::Tier;

pub trait KernelSet: Send + Sync + fmt::Debug {
    fn tier(&self) -> Tier;
    /// Output-channel tile width F.
    fn lanes(&self) -> usize;
    /// Rows per micro-kernel call.
    fn micro_rows(&self) -> usize;
    fn pack(&self, weight: &[i8], layout: WeightLayout, plan: &BlockPlan) -> PackedWeight;
    #[allow(clippy::too_many_arguments)]
    fn stage(
        &self,
        source: &dyn PatchSource,
        plan: &BlockPlan,
        pos_beg: usize,
        pos_end: usize,
        base: usize,
        buf_m: usize,
        buf: &mut [u8],
    );
    /// Kernel for exactly `rows` rows, `1 <= rows <= micro_rows()`.
    fn micro_kernel(&self, rows: usize) -> MicroKernelFn;
    fn epilogue(&self, ctx: &QuantizationContext, sums: &[i32], c0: usize, dst: &mut [u8]);
}

/// Portable kernels; any tile width up to 16 and any row group up to 12.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceKernels {
    lanes: usize,
    micro_rows: usize,
}

impl Default for ReferenceKernels {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LANES, Self::DEFAULT_ROWS)
    }
}

impl ReferenceKernels {
    pub const DEFAULT_LANES: usize = 8;
    pub const DEFAULT_ROWS: usize = 5;

    pub fn new(lanes: usize, micro_rows: usize) -> Self {
        Self {
            lanes: lanes.clamp(1, MAX_LANES),
            micro_rows: micro_rows.clamp(1, MAX_ROWS),
        }
    }
}

impl KernelSet for ReferenceKernels {
    fn tier(&self) -> Tier {
        Tier::Scalar
    }

    fn lanes(&self) -> usize {
        self.lanes
    }

    fn micro_rows(&self) -> usize {
        self.micro_rows
    }

    fn pack(&self, weight: &[i8], layout: WeightLayout, plan: &BlockPlan) -> PackedWeight {
        pack_weight(weight, layout, plan)
    }

    fn stage(
        &self,
        source: &dyn PatchSource,
        plan: &BlockPlan,
        pos_beg: usize,
        pos_end: usize,
        base: usize,
        buf_m: usize,
        buf: &mut [u8],
    ) {
        stage_patch(source, plan, pos_beg, pos_end, base, buf_m, buf)
    }

    fn micro_kernel(&self, rows: usize) -> MicroKernelFn {
        REFERENCE_TABLE[rows.min(MAX_ROWS)]
    }

    fn epilogue(&self, ctx: &QuantizationContext, sums: &[i32], c0: usize, dst: &mut [u8]) {
        ctx.apply(sums, c0, dst)
    }
}

/// Builds the kernel family for `tier`, falling back to the portable one
/// when the tier is not available on this CPU.
///
/// `lanes` only applies to the portable family; SIMD families have a fixed
/// width. `micro_rows` is clamped to what the family supports.
pub fn select(tier: Tier, lanes: Option<usize>, micro_rows: Option<usize>) -> Arc<dyn KernelSet> {
    let reference = || {
        Arc::new(ReferenceKernels::new(
            lanes.unwrap_or(ReferenceKernels::DEFAULT_LANES),
            micro_rows.unwrap_or(ReferenceKernels::DEFAULT_ROWS),
        )) as Arc<dyn KernelSet>
    };
    if !tier.is_available() {
        log::warn!("kernel tier {tier} is not available, using scalar kernels");
        return reference();
    }
    match tier {
        Tier::Scalar => reference(),
        #[cfg(target_arch = "x86_64")]
        Tier::Avx2 => match crate::kernels::avx::Avx2Kernels::new(micro_rows) {
            Some(k) => Arc::new(k),
            None => reference(),
        },
        #[cfg(target_arch = "aarch64")]
        Tier::Neon => match crate::kernels::neon::NeonKernels::new(micro_rows) {
            Some(k) => Arc::new(k),
            None => reference(),
        },
        #[allow(unreachable_patterns)]
        _ => reference(),
    }
}
