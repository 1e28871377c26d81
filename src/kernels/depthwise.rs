//! Direct depthwise convolution over NHWC images.
//!
//! Products are widened to i32 before accumulation, so depthwise outputs
//! never see the pairwise i16 saturation of the GEMM micro-kernels. Taps that
//! fall into padding contribute `src.zero * w`, which the folded bias cancels.

use crate::kernels::epilogue::QuantizationContext;
use crate::kernels::pack::DepthwiseWeight;
use crate::kernels::params::ConvParam;
use crate::kernels::staging::{CyclicGeometry, CyclicRowBuffer};
use crate::kernels::strategy::KernelSet;
use crate::kernels::utils::{carve, scratch_bytes};

#[inline(always)]
fn accumulate<T: Copy + Into<i32>>(acc: &mut [i32], px: &[T], w: &[i32]) {
    for ((a, &v), &w) in acc.iter_mut().zip(px).zip(w) {
        *a += v.into() * w;
    }
}

#[inline(always)]
fn accumulate_zero(acc: &mut [i32], zero: i32, w: &[i32]) {
    for (a, &w) in acc.iter_mut().zip(w) {
        *a += zero * w;
    }
}

/// One depthwise convolution, applied image by image.
#[derive(Clone, Copy)]
pub struct DepthwiseTask<'a> {
    pub param: &'a ConvParam,
    pub weight: &'a DepthwiseWeight,
    pub ctx: &'a QuantizationContext,
    pub kernels: &'a dyn KernelSet,
}

impl DepthwiseTask<'_> {
    fn channels(&self) -> usize {
        self.param.src_c
    }

    fn cyclic_geometry(&self) -> CyclicGeometry {
        CyclicGeometry::from_conv(self.param, self.kernels.lanes(), 1, self.ctx.src.zero)
    }

    /// Scratch bytes of the direct paths.
    pub fn scratch_len(&self) -> usize {
        scratch_bytes::<i32>(2 * self.channels())
    }

    /// Scratch bytes of the cyclic path: one accumulator row plus the ring.
    pub fn cyclic_scratch_len(&self) -> usize {
        scratch_bytes::<i32>(self.channels()) + scratch_bytes::<i32>(self.cyclic_geometry().len())
    }

    #[inline]
    fn store(&self, acc: &[i32], dy: usize, dx: usize, dst: &mut [u8]) {
        let c = self.channels();
        let o = (dy * self.param.dst_w() + dx) * c;
        self.kernels.epilogue(self.ctx, acc, 0, &mut dst[o..o + c]);
    }

    /// Bounds-checked accumulation of one output position.
    fn position(&self, image: &[u8], dy: usize, dx: usize, acc: &mut [i32]) {
        let p = self.param;
        let c = self.channels();
        let zero = self.ctx.src.zero as i32;
        acc.fill(0);
        for ky in 0..p.kernel_y {
            let sy = (dy * p.stride_y + ky * p.dilation_y) as isize - p.pad_y as isize;
            for kx in 0..p.kernel_x {
                let w = self.weight.tap(ky * p.kernel_x + kx);
                let sx = (dx * p.stride_x + kx * p.dilation_x) as isize - p.pad_x as isize;
                if sy < 0 || sx < 0 || sy >= p.src_h as isize || sx >= p.src_w as isize {
                    accumulate_zero(acc, zero, w);
                } else {
                    let o = (sy as usize * p.src_w + sx as usize) * c;
                    accumulate(acc, &image[o..o + c], w);
                }
            }
        }
    }

    /// Any kernel, stride and dilation. `image` and `dst` hold one image;
    /// output rows `y_beg..y_end` are written.
    pub fn forward_generic(&self, image: &[u8], y_beg: usize, y_end: usize, scratch: &mut [u8], dst: &mut [u8]) {
        let (acc, _) = carve::<i32>(scratch, self.channels());
        for dy in y_beg..y_end {
            for dx in 0..self.param.dst_w() {
                self.position(image, dy, dx, acc);
                self.store(acc, dy, dx, dst);
            }
        }
    }

    /// 3x3 kernels with dilation 1: border positions go through the checked
    /// path, interior positions read the nine taps directly, two output
    /// columns at a time where both fit.
    pub fn forward_3x3(&self, image: &[u8], y_beg: usize, y_end: usize, scratch: &mut [u8], dst: &mut [u8]) {
        let p = self.param;
        debug_assert!(p.is_kernel(3) && p.is_dilation(1));
        let c = self.channels();
        let (acc, _) = carve::<i32>(scratch, 2 * c);
        let (acc0, acc1) = acc.split_at_mut(c);
        let dst_w = p.dst_w();
        let inside_x = |dx: usize| {
            let sx = (dx * p.stride_x) as isize - p.pad_x as isize;
            sx >= 0 && sx as usize + 3 <= p.src_w
        };
        for dy in y_beg..y_end {
            let sy = (dy * p.stride_y) as isize - p.pad_y as isize;
            let row_inside = sy >= 0 && sy as usize + 3 <= p.src_h;
            let mut dx = 0;
            while dx < dst_w {
                if !row_inside || !inside_x(dx) {
                    self.position(image, dy, dx, acc0);
                    self.store(acc0, dy, dx, dst);
                    dx += 1;
                    continue;
                }
                let sx = dx * p.stride_x - p.pad_x;
                if dx + 1 < dst_w && inside_x(dx + 1) {
                    self.interior_x2(image, sy as usize, sx, acc0, acc1);
                    self.store(acc0, dy, dx, dst);
                    self.store(acc1, dy, dx + 1, dst);
                    dx += 2;
                } else {
                    self.interior(image, sy as usize, sx, acc0);
                    self.store(acc0, dy, dx, dst);
                    dx += 1;
                }
            }
        }
    }

    fn interior(&self, image: &[u8], sy: usize, sx: usize, acc: &mut [i32]) {
        let c = self.channels();
        let line = self.param.src_w * c;
        acc.fill(0);
        for ky in 0..3 {
            let row = &image[(sy + ky) * line + sx * c..][..3 * c];
            for kx in 0..3 {
                accumulate(acc, &row[kx * c..(kx + 1) * c], self.weight.tap(ky * 3 + kx));
            }
        }
    }

    fn interior_x2(&self, image: &[u8], sy: usize, sx: usize, acc0: &mut [i32], acc1: &mut [i32]) {
        let c = self.channels();
        let line = self.param.src_w * c;
        let step = self.param.stride_x * c;
        acc0.fill(0);
        acc1.fill(0);
        for ky in 0..3 {
            let row = &image[(sy + ky) * line + sx * c..];
            for kx in 0..3 {
                let w = self.weight.tap(ky * 3 + kx);
                let o = kx * c;
                for i in 0..c {
                    acc0[i] += row[o + i] as i32 * w[i];
                    acc1[i] += row[o + step + i] as i32 * w[i];
                }
            }
        }
    }

    /// Reads taps from a ring of zero-point padded, i32-widened input rows,
    /// so no position needs bounds checks. A fresh ring is staged per call.
    pub fn forward_cyclic(&self, image: &[u8], y_beg: usize, y_end: usize, scratch: &mut [u8], dst: &mut [u8]) {
        let p = self.param;
        let c = self.channels();
        let geo = self.cyclic_geometry();
        let buf_c = geo.buf_c;
        let (acc, rest) = carve::<i32>(scratch, c);
        let (ring_data, _) = carve::<i32>(rest, geo.len());
        let mut ring = CyclicRowBuffer::new(geo, ring_data);
        let dst_h = p.dst_h();
        for dy in y_beg..y_end {
            ring.stage(image, dy, dy + 1, dy + 1 == dst_h);
            for dx in 0..p.dst_w() {
                acc.fill(0);
                for ky in 0..p.kernel_y {
                    let row = ring.row(dy * p.stride_y + ky * p.dilation_y);
                    for kx in 0..p.kernel_x {
                        let x = dx * p.stride_x + kx * p.dilation_x;
                        accumulate(acc, &row[x * buf_c..x * buf_c + c], self.weight.tap(ky * p.kernel_x + kx));
                    }
                }
                self.store(acc, dy, dx, dst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::micro::tests::lcg;
    use crate::kernels::params::ActivationKind;
    use crate::kernels::pack::pack_depthwise;
    use crate::kernels::quantize::Quant;
    use crate::kernels::strategy::ReferenceKernels;

    struct Case {
        param: ConvParam,
        src: Vec<u8>,
        weight: DepthwiseWeight,
        ctx: QuantizationContext,
    }

    fn case(param: ConvParam, zero: u8) -> Case {
        let c = param.src_c;
        let taps = param.kernel_y * param.kernel_x;
        let mut seed = (c * 13 + taps) as u32;
        let src: Vec<u8> = (0..param.src_size()).map(|_| lcg(&mut seed) as u8).collect();
        let raw: Vec<i8> = (0..taps * c).map(|_| lcg(&mut seed) as i8).collect();
        let sums: Vec<i32> = (0..c).map(|ch| (0..taps).map(|t| raw[t * c + ch] as i32).sum()).collect();
        let ctx = QuantizationContext::new(
            Quant::new(0.02, zero),
            Quant::new(0.1, 100),
            None,
            &vec![0.004; c],
            None,
            &sums,
            ActivationKind::Identity,
            &[],
        )
        .unwrap();
        Case {
            weight: pack_depthwise(&raw, taps, c, 4),
            param,
            src,
            ctx,
        }
    }

    fn run(case: &Case, which: usize) -> Vec<u8> {
        let kernels = ReferenceKernels::new(4, 4);
        let task = DepthwiseTask {
            param: &case.param,
            weight: &case.weight,
            ctx: &case.ctx,
            kernels: &kernels,
        };
        let p = &case.param;
        let mut scratch = vec![0u8; task.scratch_len().max(task.cyclic_scratch_len())];
        let mut dst = vec![0u8; p.dst_size()];
        for b in 0..p.batch {
            let image = &case.src[b * p.src_image_size()..][..p.src_image_size()];
            let out = &mut dst[b * p.dst_image_size()..][..p.dst_image_size()];
            match which {
                0 => task.forward_generic(image, 0, p.dst_h(), &mut scratch, out),
                1 => task.forward_3x3(image, 0, p.dst_h(), &mut scratch, out),
                _ => task.forward_cyclic(image, 0, p.dst_h(), &mut scratch, out),
            }
        }
        dst
    }

    #[test]
    fn test_3x3_matches_generic() {
        for param in [
            ConvParam::new(2, 5, 7, 6, 5, (3, 3)).with_group(5).with_pad(1, 1, 1, 1),
            ConvParam::new(1, 8, 9, 9, 8, (3, 3)).with_group(8).with_stride(2, 2).with_pad(1, 1, 0, 0),
            ConvParam::new(1, 3, 3, 8, 3, (3, 3)).with_group(3),
        ] {
            let c = case(param, 37);
            assert_eq!(run(&c, 0), run(&c, 1), "{}", c.param);
        }
    }

    #[test]
    fn test_cyclic_matches_generic() {
        for param in [
            ConvParam::new(2, 5, 7, 6, 5, (3, 3)).with_group(5).with_pad(1, 1, 1, 1),
            ConvParam::new(1, 6, 10, 7, 6, (5, 3))
                .with_group(6)
                .with_stride(2, 1)
                .with_dilation(1, 2)
                .with_pad(2, 2, 2, 1),
            ConvParam::new(1, 2, 6, 6, 2, (3, 3)).with_group(2).with_dilation(2, 2),
        ] {
            let c = case(param, 200);
            assert_eq!(run(&c, 0), run(&c, 2), "{}", c.param);
        }
    }

    #[test]
    fn test_padding_taps_cancel() {
        // a constant image equal to the zero-point gives the bias-only output everywhere
        let param = ConvParam::new(1, 4, 5, 5, 4, (3, 3)).with_group(4).with_pad(1, 1, 1, 1);
        let mut c = case(param, 90);
        c.src.fill(90);
        for which in 0..3 {
            assert!(run(&c, which).iter().all(|&v| v == 100));
        }
    }
}
