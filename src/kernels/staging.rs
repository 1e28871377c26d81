//! Input staging for the compute engines.
//!
//! Patch staging flattens every output position's receptive field into one
//! contraction row (im2col over NHWC). Cyclic staging keeps only a sliding
//! window of padded input rows in a power-of-two ring.

use crate::kernels::params::ConvParam;
use crate::kernels::plan::{BlockPlan, ReorderType, MICRO_K};
use crate::kernels::utils::{align_hi, pow2_hi};

/// Produces contraction rows for output positions.
pub trait PatchSource {
    /// Rows that can be read in place as `(data, pitch)`, skipping staging.
    fn direct(&self) -> Option<(&[u8], usize)>;
    /// Writes the `buf_k`-byte contraction row of output position `pos`.
    fn stage_row(&self, pos: usize, row: &mut [u8]);
}

/// Patch rows of one convolution group over a run of consecutive images.
#[derive(Debug, Clone, Copy)]
pub struct ConvPatch<'a> {
    param: &'a ConvParam,
    src: &'a [u8],
    group: usize,
    zero: u8,
    dst_h: usize,
    dst_w: usize,
}

impl<'a> ConvPatch<'a> {
    /// `src` starts at the first image; `zero` fills taps that fall into padding.
    pub fn new(param: &'a ConvParam, src: &'a [u8], group: usize, zero: u8) -> Self {
        Self {
            param,
            src,
            group,
            zero,
            dst_h: param.dst_h(),
            dst_w: param.dst_w(),
        }
    }
}

impl PatchSource for ConvPatch<'_> {
    fn direct(&self) -> Option<(&[u8], usize)> {
        let p = self.param;
        (p.is_1x1() && p.group == 1 && p.src_c % MICRO_K == 0).then_some((self.src, p.src_c))
    }

    fn stage_row(&self, pos: usize, row: &mut [u8]) {
        let p = self.param;
        let img = pos / (self.dst_h * self.dst_w);
        let dy = pos / self.dst_w % self.dst_h;
        let dx = pos % self.dst_w;
        let image = &self.src[img * p.src_image_size()..][..p.src_image_size()];
        let gc = p.group_src_c();
        let c0 = self.group * gc;
        let run = p.kernel_x * gc;
        let line_len = p.src_w * p.src_c;
        let sx0 = (dx * p.stride_x) as isize - p.pad_x as isize;
        let contiguous = p.dilation_x == 1
            && gc == p.src_c
            && sx0 >= 0
            && sx0 as usize + p.kernel_x <= p.src_w;
        let mut o = 0;
        for ky in 0..p.kernel_y {
            let sy = (dy * p.stride_y + ky * p.dilation_y) as isize - p.pad_y as isize;
            if sy < 0 || sy >= p.src_h as isize {
                row[o..o + run].fill(self.zero);
                o += run;
                continue;
            }
            let line = &image[sy as usize * line_len..][..line_len];
            if contiguous {
                let start = sx0 as usize * p.src_c;
                row[o..o + run].copy_from_slice(&line[start..start + run]);
                o += run;
                continue;
            }
            for kx in 0..p.kernel_x {
                let sx = sx0 + (kx * p.dilation_x) as isize;
                let dst = &mut row[o..o + gc];
                if sx < 0 || sx >= p.src_w as isize {
                    dst.fill(self.zero);
                } else {
                    dst.copy_from_slice(&line[sx as usize * p.src_c + c0..][..gc]);
                }
                o += gc;
            }
        }
        row[o..].fill(0);
    }
}

/// Rows of a row-major `[m, k]` matrix, padded with zeros to `buf_k`.
#[derive(Debug, Clone, Copy)]
pub struct MatrixRows<'a> {
    data: &'a [u8],
    k: usize,
}

impl<'a> MatrixRows<'a> {
    pub fn new(data: &'a [u8], k: usize) -> Self {
        Self { data, k }
    }
}

impl PatchSource for MatrixRows<'_> {
    fn direct(&self) -> Option<(&[u8], usize)> {
        (self.k % MICRO_K == 0).then_some((self.data, self.k))
    }

    fn stage_row(&self, pos: usize, row: &mut [u8]) {
        row[..self.k].copy_from_slice(&self.data[pos * self.k..][..self.k]);
        row[self.k..].fill(0);
    }
}

/// Stages positions `pos_beg..pos_end` into `buf`.
///
/// `base` is the position stored at row 0 and `buf_m` the number of rows the
/// buffer holds; with `ReorderType::KBlocked` each contraction block `k0`
/// occupies `buf[k0 * buf_m..]` with a row pitch equal to the block width and
/// the row at `buf[buf_m * buf_k..]` is used as a bounce row, so `buf` must
/// hold `plan.staging_len(buf_m)` bytes.
pub fn stage_patch(
    source: &dyn PatchSource,
    plan: &BlockPlan,
    pos_beg: usize,
    pos_end: usize,
    base: usize,
    buf_m: usize,
    buf: &mut [u8],
) {
    let buf_k = plan.buf_k;
    match plan.reorder {
        ReorderType::RowMajor => {
            for pos in pos_beg..pos_end {
                let r = pos - base;
                source.stage_row(pos, &mut buf[r * buf_k..(r + 1) * buf_k]);
            }
        }
        ReorderType::KBlocked => {
            let (blocks, row) = buf.split_at_mut(buf_m * buf_k);
            let row = &mut row[..buf_k];
            for pos in pos_beg..pos_end {
                let r = pos - base;
                source.stage_row(pos, row);
                for (k0, kw) in plan.k_blocks() {
                    blocks[k0 * buf_m + r * kw..][..kw].copy_from_slice(&row[k0..k0 + kw]);
                }
            }
        }
    }
}

/// Shape of a cyclic row buffer over one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclicGeometry {
    pub src_h: usize,
    pub src_w: usize,
    pub src_c: usize,
    pub buf_c: usize,
    pub pad_y: usize,
    pub pad_x: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    /// Padded input rows one output row reads.
    pub window: usize,
    pub stride_y: usize,
    /// Output rows staged per call.
    pub step_h: usize,
    pub zero: u8,
}

impl CyclicGeometry {
    pub fn from_conv(p: &ConvParam, lanes: usize, step_h: usize, zero: u8) -> Self {
        Self {
            src_h: p.src_h,
            src_w: p.src_w,
            src_c: p.src_c,
            buf_c: align_hi(p.src_c, lanes),
            pad_y: p.pad_y,
            pad_x: p.pad_x,
            pad_h: p.pad_h,
            pad_w: p.pad_w,
            window: (p.kernel_y - 1) * p.dilation_y + 1,
            stride_y: p.stride_y,
            step_h: step_h.max(1),
            zero,
        }
    }
    pub fn buf_w(&self) -> usize {
        self.pad_x + self.src_w + self.pad_w
    }
    pub fn padded_h(&self) -> usize {
        self.pad_y + self.src_h + self.pad_h
    }
    /// Ring height: a power of two covering `step_h` output rows.
    pub fn rows(&self) -> usize {
        pow2_hi((self.step_h - 1) * self.stride_y + self.window)
    }
    pub fn row_len(&self) -> usize {
        self.buf_w() * self.buf_c
    }
    /// Elements the ring occupies.
    pub fn len(&self) -> usize {
        self.rows() * self.row_len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sliding window of padded input rows, indexed by padded row number modulo
/// the ring height. Padding columns, padding rows and channel tails hold the
/// zero-point.
#[derive(Debug)]
pub struct CyclicRowBuffer<'a, T> {
    geo: CyclicGeometry,
    data: &'a mut [T],
    /// Padded rows `lo..hi` are currently valid.
    lo: usize,
    hi: usize,
}

impl<'a, T: Copy + From<u8>> CyclicRowBuffer<'a, T> {
    pub fn new(geo: CyclicGeometry, data: &'a mut [T]) -> Self {
        assert!(data.len() >= geo.len(), "cyclic buffer too small");
        Self {
            geo,
            data,
            lo: 0,
            hi: 0,
        }
    }

    pub fn geometry(&self) -> &CyclicGeometry {
        &self.geo
    }

    /// Forgets every staged row, e.g. before the next image.
    pub fn reset(&mut self) {
        self.lo = 0;
        self.hi = 0;
    }

    /// Makes the input rows of output rows `y_beg..y_end` available.
    ///
    /// Ranges must not exceed `step_h` rows. Consecutive increasing ranges
    /// only stage the rows not already present. With `is_last` the trailing
    /// padding rows that still fit into the ring are staged as well.
    pub fn stage(&mut self, image: &[u8], y_beg: usize, y_end: usize, is_last: bool) {
        let g = self.geo;
        assert!(y_beg < y_end && y_end - y_beg <= g.step_h, "bad row range {y_beg}..{y_end}");
        let rows = g.rows();
        let need_beg = y_beg * g.stride_y;
        let mut need_end = (y_end - 1) * g.stride_y + g.window;
        if is_last {
            need_end = need_end.max(g.padded_h().min(need_beg + rows));
        }
        let start = if need_beg >= self.lo && need_beg <= self.hi && self.hi > 0 {
            self.hi
        } else {
            self.lo = need_beg;
            need_beg
        };
        for pr in start..need_end {
            self.fill_row(image, pr);
        }
        self.hi = self.hi.max(need_end);
        if start == need_beg {
            self.hi = need_end;
        }
        self.lo = self.lo.max(self.hi.saturating_sub(rows));
        log::trace!("cyclic rows {}..{} for output rows {y_beg}..{y_end}", self.lo, self.hi);
    }

    fn fill_row(&mut self, image: &[u8], pr: usize) {
        let g = self.geo;
        let row_len = g.row_len();
        let slot = (pr & (g.rows() - 1)) * row_len;
        let slot = &mut self.data[slot..slot + row_len];
        let zero = T::from(g.zero);
        let sy = pr as isize - g.pad_y as isize;
        if sy < 0 || sy >= g.src_h as isize {
            slot.fill(zero);
            return;
        }
        let line = &image[sy as usize * g.src_w * g.src_c..][..g.src_w * g.src_c];
        slot[..g.pad_x * g.buf_c].fill(zero);
        for (x, px) in line.chunks_exact(g.src_c).enumerate() {
            let dst = &mut slot[(g.pad_x + x) * g.buf_c..][..g.buf_c];
            for (d, &v) in dst.iter_mut().zip(px) {
                *d = T::from(v);
            }
            dst[g.src_c..].fill(zero);
        }
        slot[(g.pad_x + g.src_w) * g.buf_c..].fill(zero);
    }

    /// Staged padded row `pr`: `buf_w` pixels of `buf_c` channels.
    #[inline]
    pub fn row(&self, pr: usize) -> &[T] {
        debug_assert!(pr >= self.lo && pr < self.hi, "row {pr} not staged");
        let row_len = self.geo.row_len();
        let slot = (pr & (self.geo.rows() - 1)) * row_len;
        &self.data[slot..slot + row_len]
    }
}
