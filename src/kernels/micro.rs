//! Micro-kernel contract shared by every tier.
//!
//! A micro-kernel multiplies up to `micro_m` staged rows with one or two
//! F-wide packed weight tiles. Every pair of adjacent contraction products is
//! summed and clamped to the i16 range before it reaches the i32 accumulator,
//! which is exactly what `maddubs`-style instructions do; the scalar kernel
//! reproduces it so all tiers agree bit for bit.

use crate::kernels::plan::MICRO_K;

/// Largest row group any kernel family uses.
pub const MAX_ROWS: usize = 12;
/// Largest tile width any kernel family uses.
pub const MAX_LANES: usize = 16;
/// Accumulator tile: `MAX_ROWS` rows of two tiles.
pub const TILE_LEN: usize = MAX_ROWS * 2 * MAX_LANES;

/// Operands of one micro-kernel call.
#[derive(Debug, Clone, Copy)]
pub struct MicroArgs<'a> {
    /// First staged row; row `r` starts at `r * src_stride`.
    pub src: &'a [u8],
    pub src_stride: usize,
    /// First tile at the current contraction offset; the second tile starts
    /// `tile_stride` bytes later.
    pub weight: &'a [i8],
    pub tile_stride: usize,
    /// 1 or 2.
    pub tiles: usize,
    /// Contraction length, a multiple of 4.
    pub k: usize,
    /// Tile width F.
    pub lanes: usize,
}

impl MicroArgs<'_> {
    /// Checks that every byte a kernel over `rows` rows reads is in bounds.
    pub fn check(&self, rows: usize) {
        assert!(self.k % MICRO_K == 0, "contraction {} is not a multiple of 4", self.k);
        assert!(self.tiles == 1 || self.tiles == 2);
        assert!(rows >= 1 && rows <= MAX_ROWS && self.lanes <= MAX_LANES);
        assert!(
            self.src.len() >= (rows - 1) * self.src_stride + self.k,
            "staged rows out of bounds"
        );
        assert!(
            self.weight.len() >= (self.tiles - 1) * self.tile_stride + self.k * self.lanes,
            "packed weight out of bounds"
        );
    }
}

/// `acc[row * 2F + lane] (+)= sum_k src[row][k] * weight[k][lane]`; the
/// accumulator is reset first unless `update` is set.
pub type MicroKernelFn = fn(&MicroArgs<'_>, bool, &mut [i32]);

/// `clamp(a0 * b0 + a1 * b1, i16::MIN, i16::MAX)`.
#[inline(always)]
pub fn madd_pair(a0: u8, b0: i8, a1: u8, b1: i8) -> i32 {
    let v = a0 as i32 * b0 as i32 + a1 as i32 * b1 as i32;
    v.clamp(i16::MIN as i32, i16::MAX as i32)
}

/// Four-element step of the pairwise saturating dot product.
#[inline(always)]
pub fn madd4(s: &[u8], w: &[i8]) -> i32 {
    madd_pair(s[0], w[0], s[1], w[1]) + madd_pair(s[2], w[2], s[3], w[3])
}

fn reference_kernel<const M: usize>(args: &MicroArgs<'_>, update: bool, acc: &mut [i32]) {
    args.check(M);
    let f = args.lanes;
    let dd = 2 * f;
    if !update {
        acc[..M * dd].fill(0);
    }
    for t in 0..args.tiles {
        let weight = &args.weight[t * args.tile_stride..];
        for r in 0..M {
            let src = &args.src[r * args.src_stride..][..args.k];
            let row = &mut acc[r * dd + t * f..][..f];
            for (k4, s) in src.chunks_exact(MICRO_K).enumerate() {
                let step = &weight[k4 * MICRO_K * f..][..MICRO_K * f];
                for (lane, w) in step.chunks_exact(MICRO_K).enumerate() {
                    row[lane] = row[lane].wrapping_add(madd4(s, w));
                }
            }
        }
    }
}

/// Row-count table of the portable kernel; entry `m` handles `m` rows.
pub const REFERENCE_TABLE: [MicroKernelFn; MAX_ROWS + 1] = [
    reference_kernel::<1>,
    reference_kernel::<1>,
    reference_kernel::<2>,
    reference_kernel::<3>,
    reference_kernel::<4>,
    reference_kernel::<5>,
    reference_kernel::<6>,
    reference_kernel::<7>,
    reference_kernel::<8>,
    reference_kernel::<9>,
    reference_kernel::<10>,
    reference_kernel::<11>,
    reference_kernel::<12>,
];
