//! NEON u8 x i8 micro-kernels.
//!
//! NEON has no `maddubs`, so each 4-byte step widens both operands to i16,
//! multiplies, pair-adds to i32 and clamps the pair sums to the i16 range
//! before folding them into the accumulators.

#![allow(unsafe_op_in_unsafe_fn)]

use core::arch::aarch64::*;

use crate::kernels::epilogue::QuantizationContext;
use crate::kernels::micro::{MicroArgs, MicroKernelFn};
use crate::kernels::pack::{PackedWeight, WeightLayout};
use crate::kernels::plan::BlockPlan;
use crate::kernels::staging::PatchSource;
use crate::kernels::strategy::{KernelSet, ReferenceKernels};
use crate::kernels::tier::Tier;

pub const LANES: usize = 4;
pub const MICRO_ROWS: usize = 8;

#[derive(Debug, Clone)]
pub struct NeonKernels {
    reference: ReferenceKernels,
    micro_rows: usize,
}

impl NeonKernels {
    pub fn new(micro_rows: Option<usize>) -> Option<Self> {
        if !std::arch::is_aarch64_feature_detected!("neon") {
            return None;
        }
        let micro_rows = micro_rows.unwrap_or(MICRO_ROWS).clamp(1, MICRO_ROWS);
        Some(Self {
            reference: ReferenceKernels::new(LANES, micro_rows),
            micro_rows,
        })
    }
}

impl KernelSet for NeonKernels {
    fn tier(&self) -> Tier {
        Tier::Neon
    }

    fn lanes(&self) -> usize {
        LANES
    }

    fn micro_rows(&self) -> usize {
        self.micro_rows
    }

    fn pack(&self, weight: &[i8], layout: WeightLayout, plan: &BlockPlan) -> PackedWeight {
        self.reference.pack(weight, layout, plan)
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
        self.reference
            .stage(source, plan, pos_beg, pos_end, base, buf_m, buf)
    }

    fn micro_kernel(&self, rows: usize) -> MicroKernelFn {
        NEON_TABLE[rows.min(MICRO_ROWS)]
    }

    fn epilogue(&self, ctx: &QuantizationContext, sums: &[i32], c0: usize, dst: &mut [u8]) {
        self.reference.epilogue(ctx, sums, c0, dst)
    }
}

pub(crate) const NEON_TABLE: [MicroKernelFn; MICRO_ROWS + 1] = [
    gemm_i8_2xm::<1>,
    gemm_i8_2xm::<1>,
    gemm_i8_2xm::<2>,
    gemm_i8_2xm::<3>,
    gemm_i8_2xm::<4>,
    gemm_i8_2xm::<5>,
    gemm_i8_2xm::<6>,
    gemm_i8_2xm::<7>,
    gemm_i8_2xm::<8>,
];

fn gemm_i8_2xm<const M: usize>(args: &MicroArgs<'_>, update: bool, acc: &mut [i32]) {
    args.check(M);
    assert_eq!(args.lanes, LANES, "NEON kernels use 4-lane tiles");
    assert!(acc.len() >= M * 2 * LANES);
    debug_assert!(std::arch::is_aarch64_feature_detected!("neon"));
    // Reachable only through `NeonKernels`, which requires detected NEON.
    unsafe { gemm_i8_2xm_neon::<M>(args, update, acc) }
}

/// Saturating 4-byte dot product of one broadcast source word against four
/// weight lanes.
#[inline(always)]
unsafe fn madd4_lanes(a: uint8x16_t, b: int8x16_t) -> int32x4_t {
    let lo_i16 = vdupq_n_s32(i16::MIN as i32);
    let hi_i16 = vdupq_n_s32(i16::MAX as i32);
    let a_lo = vreinterpretq_s16_u16(vmovl_u8(vget_low_u8(a)));
    let a_hi = vreinterpretq_s16_u16(vmovl_u8(vget_high_u8(a)));
    let p_lo = vpaddlq_s16(vmulq_s16(a_lo, vmovl_s8(vget_low_s8(b))));
    let p_hi = vpaddlq_s16(vmulq_s16(a_hi, vmovl_s8(vget_high_s8(b))));
    let p_lo = vminq_s32(vmaxq_s32(p_lo, lo_i16), hi_i16);
    let p_hi = vminq_s32(vmaxq_s32(p_hi, lo_i16), hi_i16);
    vpaddq_s32(p_lo, p_hi)
}

/// # Safety
///
/// The CPU must support NEON, `args` must pass `args.check(M)` with 4-lane
/// tiles and `acc` must hold at least `M * 8` values.
#[target_feature(enable = "neon")]
unsafe fn gemm_i8_2xm_neon<const M: usize>(args: &MicroArgs<'_>, update: bool, acc: &mut [i32]) {
    let dst = acc.as_mut_ptr();
    let mut c0 = [vdupq_n_s32(0); M];
    let mut c1 = [vdupq_n_s32(0); M];
    if update {
        for r in 0..M {
            c0[r] = vld1q_s32(dst.add(r * 2 * LANES));
            c1[r] = vld1q_s32(dst.add(r * 2 * LANES + LANES));
        }
    }
    let src = args.src.as_ptr();
    let stride = args.src_stride;
    let w0 = args.weight.as_ptr();
    let two = args.tiles == 2;
    for k in (0..args.k).step_by(4) {
        let b0 = vld1q_s8(w0.add(k * LANES));
        let b1 = if two {
            vld1q_s8(w0.add(args.tile_stride + k * LANES))
        } else {
            vdupq_n_s8(0)
        };
        for r in 0..M {
            let word = (src.add(r * stride + k) as *const u32).read_unaligned();
            let a = vreinterpretq_u8_u32(vdupq_n_u32(word));
            c0[r] = vaddq_s32(c0[r], madd4_lanes(a, b0));
            if two {
                c1[r] = vaddq_s32(c1[r], madd4_lanes(a, b1));
            }
        }
    }
    for r in 0..M {
        vst1q_s32(dst.add(r * 2 * LANES), c0[r]);
        vst1q_s32(dst.add(r * 2 * LANES + LANES), c1[r]);
    }
}
