//! Block/tile sizes for the blocked GEMM engine.
//!
//! The contraction macro block keeps `macro_k x micro_d` packed weight bytes
//! in L1, a row macro block keeps `macro_h * row_width x macro_k` staged bytes
//! in L2 and an output-channel macro block keeps `macro_d x macro_k` weight
//! bytes in L3.

use std::fmt;

use crate::kernels::cache::CacheSizes;
use crate::kernels::params::{ConvParam, GemmParam};
use crate::kernels::utils::{align_hi, align_lo};

/// Contraction elements consumed per micro-kernel step.
pub const MICRO_K: usize = 4;

/// How staged rows are laid out in the patch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReorderType {
    /// One row of `buf_k` bytes per output position.
    RowMajor,
    /// Each `macro_k` slice of every row is stored contiguously.
    KBlocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockPlan {
    /// Output-channel tile width F.
    pub lanes: usize,
    pub micro_d: usize,
    pub micro_m: usize,
    pub micro_k: usize,
    /// True contraction length.
    pub k: usize,
    pub buf_k: usize,
    /// True output channels (per group).
    pub n: usize,
    pub buf_d: usize,
    /// Output rows per image.
    pub height: usize,
    /// Output positions per row.
    pub row_width: usize,
    /// Images processed together in one pass.
    pub batch: usize,
    pub macro_k: usize,
    pub macro_h: usize,
    pub macro_d: usize,
    pub reorder: ReorderType,
}

impl BlockPlan {
    pub fn new(
        height: usize,
        row_width: usize,
        batch: usize,
        k: usize,
        n: usize,
        lanes: usize,
        micro_m: usize,
        cache: &CacheSizes,
    ) -> Self {
        let micro_d = 2 * lanes;
        let row_width = row_width.max(1);
        let positions = height * row_width;
        let buf_k = align_hi(k.max(1), MICRO_K);
        let buf_d = align_hi(n.max(1), micro_d);
        let macro_k = align_lo(cache.l1 / micro_d, MICRO_K).clamp(MICRO_K, buf_k);
        let mut coalesced = 1;
        if batch > 1 && positions * buf_k <= cache.l2 {
            coalesced = (1..=batch)
                .rev()
                .find(|b| batch % b == 0 && b * positions * buf_k <= cache.l2)
                .unwrap_or(1);
        }
        let macro_h = (cache.l2 / macro_k / row_width).clamp(1, height.max(1) * coalesced);
        let macro_d = align_lo(cache.l3 / macro_k, micro_d).clamp(micro_d, buf_d);
        let reorder = if macro_k == buf_k {
            ReorderType::RowMajor
        } else {
            ReorderType::KBlocked
        };
        Self {
            lanes,
            micro_d,
            micro_m,
            micro_k: MICRO_K,
            k,
            buf_k,
            n,
            buf_d,
            height,
            row_width,
            batch: coalesced,
            macro_k,
            macro_h,
            macro_d,
            reorder,
        }
    }

    pub fn for_conv(p: &ConvParam, lanes: usize, micro_m: usize, cache: &CacheSizes) -> Self {
        let plan = Self::new(
            p.dst_h(),
            p.dst_w(),
            p.batch,
            p.contraction(),
            p.group_dst_c(),
            lanes,
            micro_m,
            cache,
        );
        log::debug!("conv {p}: {plan}");
        plan
    }

    pub fn for_gemm(p: &GemmParam, lanes: usize, micro_m: usize, cache: &CacheSizes) -> Self {
        let plan = Self::new(p.m, 1, 1, p.k, p.n, lanes, micro_m, cache);
        log::debug!("gemm {}x{}x{}: {plan}", p.m, p.n, p.k);
        plan
    }

    /// Output positions of one image.
    pub fn positions(&self) -> usize {
        self.height * self.row_width
    }

    /// Output positions covered by one row macro block.
    pub fn macro_positions(&self) -> usize {
        self.macro_h * self.row_width
    }

    /// `(start, len)` of each contraction macro block.
    pub fn k_blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.buf_k)
            .step_by(self.macro_k)
            .map(move |k0| (k0, self.macro_k.min(self.buf_k - k0)))
    }

    /// Partial sums survive between contraction blocks only when there is more than one.
    pub fn needs_sums(&self) -> bool {
        self.macro_k < self.buf_k
    }

    /// Staged bytes for `positions` output positions. A `KBlocked` buffer
    /// carries one trailing row that whole rows are staged through before
    /// they are split into blocks.
    pub fn staging_len(&self, positions: usize) -> usize {
        let bounce = match self.reorder {
            ReorderType::RowMajor => 0,
            ReorderType::KBlocked => self.buf_k,
        };
        positions * self.buf_k + bounce
    }

    /// Accumulator entries for `positions` output positions.
    pub fn sums_len(&self, positions: usize) -> usize {
        if self.needs_sums() {
            positions * self.macro_d
        } else {
            0
        }
    }
}

impl fmt::Display for BlockPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "F={} microM={} K={}/{} D={}/{} macroK={} macroH={} macroD={} batch={} {:?}",
            self.lanes,
            self.micro_m,
            self.k,
            self.buf_k,
            self.n,
            self.buf_d,
            self.macro_k,
            self.macro_h,
            self.macro_d,
            self.batch,
            self.reorder
        )
    }
}
