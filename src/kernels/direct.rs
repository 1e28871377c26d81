//! Direct convolution for narrow inputs.
//!
//! Instead of staging a patch matrix, padded input rows go into a ring of
//! zero-point bytes and every kernel tap is one micro-kernel call that reads
//! the ring in place, `stride_x * buf_c` bytes between output columns. The
//! accumulator tile carries over from tap to tap (`update` after the first)
//! and goes straight to the epilogue after the last one.
//!
//! Channels are padded to a multiple of 4 per tap, so the pairwise i16
//! saturation never pairs channels of two different taps.

use crate::kernels::epilogue::QuantizationContext;
use crate::kernels::micro::{MicroArgs, TILE_LEN};
use crate::kernels::pack::PackedWeight;
use crate::kernels::params::ConvParam;
use crate::kernels::plan::MICRO_K;
use crate::kernels::staging::{CyclicGeometry, CyclicRowBuffer};
use crate::kernels::strategy::KernelSet;
use crate::kernels::utils::{carve, scratch_bytes};

/// One non-grouped convolution with weights from `pack_direct`.
#[derive(Clone, Copy)]
pub struct DirectTask<'a> {
    pub param: &'a ConvParam,
    pub packed: &'a PackedWeight,
    pub ctx: &'a QuantizationContext,
    pub kernels: &'a dyn KernelSet,
}

impl DirectTask<'_> {
    fn geometry(&self) -> CyclicGeometry {
        CyclicGeometry::from_conv(self.param, MICRO_K, 1, self.ctx.src.zero)
    }

    /// Scratch bytes of `forward`: the row ring.
    pub fn scratch_len(&self) -> usize {
        scratch_bytes::<u8>(self.geometry().len())
    }

    /// Output rows `y_beg..y_end` of `batch` consecutive images.
    pub fn forward(&self, src: &[u8], batch: usize, y_beg: usize, y_end: usize, scratch: &mut [u8], dst: &mut [u8]) {
        let p = self.param;
        let geo = self.geometry();
        let buf_c = geo.buf_c;
        let (ring_data, _) = carve::<u8>(scratch, geo.len());
        let mut ring = CyclicRowBuffer::new(geo, ring_data);
        let f = self.packed.lanes;
        let micro_d = 2 * f;
        let micro_m = self.kernels.micro_rows();
        let tile_stride = self.packed.tile_stride();
        let (dst_h, dst_w) = (p.dst_h(), p.dst_w());
        let mut acc = [0i32; TILE_LEN];
        for b in 0..batch {
            let image = &src[b * p.src_image_size()..][..p.src_image_size()];
            let out = &mut dst[b * p.dst_image_size()..][..p.dst_image_size()];
            // rows staged for the previous image must not be reused
            ring.reset();
            for dy in y_beg..y_end {
                ring.stage(image, dy, dy + 1, dy + 1 == dst_h);
                for d in (0..p.dst_c).step_by(micro_d) {
                    let dd = micro_d.min(p.dst_c - d);
                    let tiles = if dd > f { 2 } else { 1 };
                    for dx0 in (0..dst_w).step_by(micro_m) {
                        let mm = micro_m.min(dst_w - dx0);
                        let kernel = self.kernels.micro_kernel(mm);
                        for ky in 0..p.kernel_y {
                            let row = ring.row(dy * p.stride_y + ky * p.dilation_y);
                            for kx in 0..p.kernel_x {
                                let tap = ky * p.kernel_x + kx;
                                let x = dx0 * p.stride_x + kx * p.dilation_x;
                                let args = MicroArgs {
                                    src: &row[x * buf_c..],
                                    src_stride: p.stride_x * buf_c,
                                    weight: self.packed.tile_from(d / f, tap * buf_c),
                                    tile_stride,
                                    tiles,
                                    k: buf_c,
                                    lanes: f,
                                };
                                kernel(&args, tap != 0, &mut acc);
                            }
                        }
                        for r in 0..mm {
                            let o = (dy * dst_w + dx0 + r) * p.dst_c + d;
                            self.kernels
                                .epilogue(self.ctx, &acc[r * micro_d..][..dd], d, &mut out[o..o + dd]);
                        }
                    }
                }
            }
        }
        log::trace!("direct rows {y_beg}..{y_end} of {batch} images, buf_c={buf_c}");
    }
}
