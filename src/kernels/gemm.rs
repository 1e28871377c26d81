//! Blocked u8 x i8 GEMM engine shared by the convolution and inner-product
//! front-ends.
//!
//! Loop order is output-channel macro block, contraction macro block, row
//! macro block, then micro tiles. Rows are staged once, on the first visit
//! (`dc == 0 && mak == 0`). Partial sums live in the i32 accumulator buffer
//! only while more contraction blocks follow; the last block hands the
//! accumulators straight to the epilogue.

use crate::kernels::epilogue::QuantizationContext;
use crate::kernels::micro::{MicroArgs, TILE_LEN};
use crate::kernels::pack::PackedWeight;
use crate::kernels::plan::{BlockPlan, ReorderType};
use crate::kernels::staging::PatchSource;
use crate::kernels::strategy::KernelSet;
use crate::kernels::utils::{carve, scratch_bytes};

/// Everything fixed about one GEMM (or one convolution group).
#[derive(Clone, Copy)]
pub struct GemmTask<'a> {
    pub plan: &'a BlockPlan,
    pub packed: &'a PackedWeight,
    pub ctx: &'a QuantizationContext,
    pub kernels: &'a dyn KernelSet,
    /// Bytes between consecutive output positions in `dst`.
    pub dst_pitch: usize,
    /// First output channel written by this task.
    pub channel_offset: usize,
}

impl GemmTask<'_> {
    /// Scratch bytes `forward` needs for `positions` output positions.
    pub fn scratch_len(&self, positions: usize, direct: bool) -> usize {
        let staging = if direct {
            0
        } else {
            self.plan.staging_len(positions)
        };
        scratch_bytes::<u8>(staging) + scratch_bytes::<i32>(self.plan.sums_len(positions))
    }

    /// Computes output positions `pos_beg..pos_end` of `source`.
    ///
    /// Position `p` is written to `dst[p * dst_pitch + channel_offset..]`.
    pub fn forward(
        &self,
        source: &dyn PatchSource,
        pos_beg: usize,
        pos_end: usize,
        scratch: &mut [u8],
        dst: &mut [u8],
    ) {
        if pos_beg >= pos_end {
            return;
        }
        let plan = self.plan;
        let direct = source.direct();
        let buf_m = pos_end - pos_beg;
        let staging = if direct.is_some() {
            0
        } else {
            plan.staging_len(buf_m)
        };
        let (stage_buf, rest) = carve::<u8>(scratch, staging);
        let (sums, _) = carve::<i32>(rest, plan.sums_len(buf_m));
        log::trace!("gemm positions {pos_beg}..{pos_end}, direct={}", direct.is_some());

        let f = plan.lanes;
        let micro_d = plan.micro_d;
        let macro_pos = plan.macro_positions();
        let tile_stride = self.packed.tile_stride();
        // reset by the kernel unless `update`, so it is never cleared here
        let mut acc = [0i32; TILE_LEN];
        for dc in (0..plan.n).step_by(plan.macro_d) {
            let md = plan.macro_d.min(plan.n - dc);
            for (mak, kw) in plan.k_blocks() {
                let update = mak != 0;
                let last = mak + kw == plan.buf_k;
                for p0 in (pos_beg..pos_end).step_by(macro_pos) {
                    let p1 = (p0 + macro_pos).min(pos_end);
                    if direct.is_none() && dc == 0 && mak == 0 {
                        self.kernels
                            .stage(source, plan, p0, p1, pos_beg, buf_m, stage_buf);
                    }
                    let (rows, pitch): (&[u8], usize) = match direct {
                        Some((data, pitch)) => (&data[p0 * pitch + mak..], pitch),
                        None => match plan.reorder {
                            ReorderType::RowMajor => {
                                (&stage_buf[(p0 - pos_beg) * plan.buf_k + mak..], plan.buf_k)
                            }
                            ReorderType::KBlocked => {
                                (&stage_buf[mak * buf_m + (p0 - pos_beg) * kw..], kw)
                            }
                        },
                    };
                    for d in (0..md).step_by(micro_d) {
                        let dd = micro_d.min(md - d);
                        let weight = self.packed.tile_from((dc + d) / f, mak);
                        let tiles = if dd > f { 2 } else { 1 };
                        for m0 in (p0..p1).step_by(plan.micro_m) {
                            let mm = plan.micro_m.min(p1 - m0);
                            let args = MicroArgs {
                                src: &rows[(m0 - p0) * pitch..],
                                src_stride: pitch,
                                weight,
                                tile_stride,
                                tiles,
                                k: kw,
                                lanes: f,
                            };
                            if update {
                                for r in 0..mm {
                                    let s = (m0 + r - pos_beg) * plan.macro_d + d;
                                    acc[r * micro_d..][..dd].copy_from_slice(&sums[s..s + dd]);
                                }
                            }
                            (self.kernels.micro_kernel(mm))(&args, update, &mut acc);
                            for r in 0..mm {
                                let out = &acc[r * micro_d..][..dd];
                                let pos = m0 + r;
                                if last {
                                    let c = self.channel_offset + dc + d;
                                    let o = pos * self.dst_pitch + c;
                                    self.kernels.epilogue(self.ctx, out, c, &mut dst[o..o + dd]);
                                } else {
                                    let s = (pos - pos_beg) * plan.macro_d + d;
                                    sums[s..s + dd].copy_from_slice(out);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
