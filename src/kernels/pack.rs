use crate::kernels::plan::{BlockPlan, MICRO_K};
use crate::kernels::utils::align_hi;
/// Where a raw weight matrix keeps its contraction and output-channel axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// `w[k * ld + col_offset + j]`: contraction-major, as in NHWC convolution weights.
    KxN { ld: usize, col_offset: usize },
    /// `w[j * ld + k]`: output-channel-major (transposed).
    NxK { ld: usize },
}
impl WeightLayout {
    #[inline]
    fn index(&self, k: usize, j: usize) -> usize {
        match *self {
            WeightLayout::KxN { ld, col_offset } => k * ld + col_offset + j,
            WeightLayout::NxK { ld } => j * ld + k,
        }
    }
}
/// Weights reordered into F-wide output-channel tiles.
///
/// Tile `t` occupies `buf_k * lanes` bytes starting at `t * tile_stride()`;
/// inside a tile every 4-element contraction step stores `lanes` groups of
/// 4 consecutive contraction values, one group per output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedWeight {
    pub data: Vec<i8>,
    pub lanes: usize,
    pub k: usize,
    pub buf_k: usize,
    pub n: usize,
    pub buf_d: usize,
}
impl PackedWeight {
    pub fn tile_stride(&self) -> usize {
        self.buf_k * self.lanes
    }
    /// Packed bytes of tile `t` starting at contraction offset `k0`.
    pub fn tile_from(&self, t: usize, k0: usize) -> &[i8] {
        &self.data[t * self.tile_stride() + k0 * self.lanes..]
    }
}
/// Packs a `k x n` weight matrix for the micro-kernels described by `plan`.
pub fn pack_weight(weight: &[i8], layout: WeightLayout, plan: &BlockPlan) -> PackedWeight {
    pack_tiles(weight, layout, plan.k, plan.n, plan.lanes, plan.buf_d)
}
pub fn pack_tiles(
    weight: &[i8],
    layout: WeightLayout,
    k: usize,
    n: usize,
    lanes: usize,
    buf_d: usize,
) -> PackedWeight {
    let buf_k = align_hi(k, MICRO_K);
    let buf_d = align_hi(buf_d.max(n), lanes);
    let mut data = vec![0i8; buf_d * buf_k];
    let tiles = buf_d / lanes;
    let mut o = 0;
    for t in 0..tiles {
        for k4 in (0..buf_k).step_by(MICRO_K) {
            for lane in 0..lanes {
                let j = t * lanes + lane;
                for i in 0..MICRO_K {
                    let kk = k4 + i;
                    if j < n && kk < k {
                        data[o] = weight[layout.index(kk, j)];
                    }
                    o += 1;
                }
            }
        }
    }
    PackedWeight {
        data,
        lanes,
        k,
        buf_k,
        n,
        buf_d,
    }
}
/// Packs `[taps, src_c, dst_c]` weights for the direct engine: every tap's
/// channels are padded with zero weights to a multiple of 4, so tap `t`
/// starts at contraction offset `t * align_hi(src_c, 4)`.
pub fn pack_direct(weight: &[i8], taps: usize, src_c: usize, dst_c: usize, lanes: usize) -> PackedWeight {
    let buf_c = align_hi(src_c, MICRO_K);
    let run = src_c * dst_c;
    let mut spread = vec![0i8; taps * buf_c * dst_c];
    for t in 0..taps {
        spread[t * buf_c * dst_c..][..run].copy_from_slice(&weight[t * run..(t + 1) * run]);
    }
    let layout = WeightLayout::KxN { ld: dst_c, col_offset: 0 };
    pack_tiles(&spread, layout, taps * buf_c, dst_c, lanes, align_hi(dst_c, 2 * lanes))
}
/// Per-output-channel sums of a `k x n` weight matrix, used to fold the
/// source zero-point into the bias.
pub fn weight_sums(weight: &[i8], layout: WeightLayout, k: usize, n: usize) -> Vec<i32> {
    (0..n)
        .map(|j| (0..k).map(|kk| weight[layout.index(kk, j)] as i32).sum())
        .collect()
}
/// Depthwise weights widened to i32, `[kernel_y * kernel_x][buf_c]`, zero
/// beyond the true channel count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthwiseWeight {
    pub data: Vec<i32>,
    pub channels: usize,
    pub buf_c: usize,
    pub taps: usize,
}
impl DepthwiseWeight {
    #[inline]
    pub fn tap(&self, t: usize) -> &[i32] {
        &self.data[t * self.buf_c..(t + 1) * self.buf_c]
    }
}
/// Widens depthwise weights given as `[kernel_y, kernel_x, channels]`.
pub fn pack_depthwise(weight: &[i8], taps: usize, channels: usize, lanes: usize) -> DepthwiseWeight {
    let buf_c = align_hi(channels, lanes);
    let mut data = vec![0i32; taps * buf_c];
    for t in 0..taps {
        for c in 0..channels {
            data[t * buf_c + c] = weight[t * channels + c] as i32;
        }
    }
    DepthwiseWeight {
        data,
        channels,
        buf_c,
        taps,
    }
}
