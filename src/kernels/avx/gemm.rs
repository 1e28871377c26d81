use std::arch::x86_64::*;

use crate::kernels::epilogue::QuantizationContext;
use crate::kernels::micro::MicroArgs;
use crate::kernels::micro::MicroKernelFn;
use crate::kernels::pack::{PackedWeight, WeightLayout};
use crate::kernels::plan::BlockPlan;
use crate::kernels::staging::PatchSource;
use crate::kernels::strategy::{KernelSet, ReferenceKernels};
use crate::kernels::tier::Tier;

/// i32 lanes per ymm register.
pub const LANES: usize = 8;
/// 2 x 6 accumulators leave room for two weight vectors and the broadcast.
pub const MICRO_ROWS: usize = 6;

/// AVX2 family: `vpmaddubsw` + `vpmaddwd` micro-kernels, everything else
/// from the portable family.
#[derive(Debug, Clone)]
pub struct Avx2Kernels {
    reference: ReferenceKernels,
    micro_rows: usize,
}

impl Avx2Kernels {
    /// `None` when the CPU lacks AVX2.
    pub fn new(micro_rows: Option<usize>) -> Option<Self> {
        if !is_x86_feature_detected!("avx2") {
            return None;
        }
        let micro_rows = micro_rows.unwrap_or(MICRO_ROWS).clamp(1, MICRO_ROWS);
        Some(Self {
            reference: ReferenceKernels::new(LANES, micro_rows),
            micro_rows,
        })
    }
}

impl KernelSet for Avx2Kernels {
    fn tier(&self) -> Tier {
        Tier::Avx2
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
        AVX2_TABLE[rows.min(MICRO_ROWS)]
    }

    fn epilogue(&self, ctx: &QuantizationContext, sums: &[i32], c0: usize, dst: &mut [u8]) {
        self.reference.epilogue(ctx, sums, c0, dst)
    }
}

pub(crate) const AVX2_TABLE: [MicroKernelFn; MICRO_ROWS + 1] = [
    gemm_i8_2xm::<1>,
    gemm_i8_2xm::<1>,
    gemm_i8_2xm::<2>,
    gemm_i8_2xm::<3>,
    gemm_i8_2xm::<4>,
    gemm_i8_2xm::<5>,
    gemm_i8_2xm::<6>,
];

fn gemm_i8_2xm<const M: usize>(args: &MicroArgs<'_>, update: bool, acc: &mut [i32]) {
    args.check(M);
    assert_eq!(args.lanes, LANES, "AVX2 kernels use 8-lane tiles");
    assert!(acc.len() >= M * 2 * LANES);
    debug_assert!(is_x86_feature_detected!("avx2"));
    // Reachable only through `Avx2Kernels`, which requires detected AVX2.
    unsafe { gemm_i8_2xm_avx2::<M>(args, update, acc) }
}

/// Two 8-wide output tiles by `M` rows. `vpmaddubsw` saturates each pair of
/// u8 x i8 products to i16, `vpmaddwd` against ones widens the pairs to i32.
///
/// # Safety
///
/// The CPU must support AVX2, `args` must pass `args.check(M)` with 8-lane
/// tiles and `acc` must hold at least `M * 16` values.
#[target_feature(enable = "avx2")]
pub(crate) unsafe fn gemm_i8_2xm_avx2<const M: usize>(args: &MicroArgs<'_>, update: bool, acc: &mut [i32]) {
    unsafe {
        let ones = _mm256_set1_epi16(1);
        let dst = acc.as_mut_ptr();
        let mut c0 = [_mm256_setzero_si256(); M];
        let mut c1 = [_mm256_setzero_si256(); M];
        if update {
            for r in 0..M {
                c0[r] = _mm256_loadu_si256(dst.add(r * 2 * LANES) as *const __m256i);
                c1[r] = _mm256_loadu_si256(dst.add(r * 2 * LANES + LANES) as *const __m256i);
            }
        }
        let src = args.src.as_ptr();
        let stride = args.src_stride;
        let w0 = args.weight.as_ptr();
        if args.tiles == 2 {
            let w1 = w0.add(args.tile_stride);
            for k in (0..args.k).step_by(4) {
                let b0 = _mm256_loadu_si256(w0.add(k * LANES) as *const __m256i);
                let b1 = _mm256_loadu_si256(w1.add(k * LANES) as *const __m256i);
                for r in 0..M {
                    let a = _mm256_set1_epi32((src.add(r * stride + k) as *const i32).read_unaligned());
                    c0[r] = _mm256_add_epi32(c0[r], _mm256_madd_epi16(_mm256_maddubs_epi16(a, b0), ones));
                    c1[r] = _mm256_add_epi32(c1[r], _mm256_madd_epi16(_mm256_maddubs_epi16(a, b1), ones));
                }
            }
        } else {
            for k in (0..args.k).step_by(4) {
                let b0 = _mm256_loadu_si256(w0.add(k * LANES) as *const __m256i);
                for r in 0..M {
                    let a = _mm256_set1_epi32((src.add(r * stride + k) as *const i32).read_unaligned());
                    c0[r] = _mm256_add_epi32(c0[r], _mm256_madd_epi16(_mm256_maddubs_epi16(a, b0), ones));
                }
            }
        }
        for r in 0..M {
            _mm256_storeu_si256(dst.add(r * 2 * LANES) as *mut __m256i, c0[r]);
            _mm256_storeu_si256(dst.add(r * 2 * LANES + LANES) as *mut __m256i, c1[r]);
        }
    }
}
