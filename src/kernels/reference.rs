//! Straightforward pipelines the blocked engines are checked against.
//!
//! The integer references reproduce the engines bit for bit: same contraction
//! order `(ky, kx, c)`, same pairwise i16 saturation where an engine applies
//! it (see [`Accumulation`]), same epilogue. The float references dequantize, convolve with
//! `matrixmultiply::sgemm` and requantize without the intermediate domain, so
//! they only agree to within a couple of codes.

use matrixmultiply::sgemm;

use crate::kernels::activations::activate;
use crate::kernels::epilogue::QuantizationContext;
use crate::kernels::micro::madd_pair;
use crate::kernels::params::{ConvParam, GemmParam};
use crate::kernels::quantize::round;

/// How partial products reach the i32 sum; each engine family has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accumulation {
    /// Widened products, no saturation (depthwise engines).
    Exact,
    /// Products `2i` and `2i + 1` of the whole contraction row are summed and
    /// clamped to i16 (GEMM engine).
    Pairwise,
    /// Like `Pairwise`, but pairing restarts at every tap, so a pair never
    /// spans two kernel positions (direct engine).
    PairwisePerTap,
}

/// Pairwise-saturated sum over `k0..k1`, pairs starting at `k0`.
fn pairwise(patch: &[u8], weight: &impl Fn(usize) -> i8, k0: usize, k1: usize) -> i32 {
    let mut sum = 0i32;
    for k in (k0..k1).step_by(2) {
        let (a1, b1) = if k + 1 < k1 {
            (patch[k + 1], weight(k + 1))
        } else {
            (0, 0)
        };
        sum = sum.wrapping_add(madd_pair(patch[k], weight(k), a1, b1));
    }
    sum
}

/// Dot product of a patch row with one weight column; `tap` is the number of
/// channels per kernel position.
fn dot(patch: &[u8], weight: impl Fn(usize) -> i8, mode: Accumulation, tap: usize) -> i32 {
    match mode {
        Accumulation::Exact => patch
            .iter()
            .enumerate()
            .fold(0i32, |sum, (k, &a)| sum.wrapping_add(a as i32 * weight(k) as i32)),
        Accumulation::Pairwise => pairwise(patch, &weight, 0, patch.len()),
        Accumulation::PairwisePerTap => (0..patch.len())
            .step_by(tap.max(1))
            .fold(0i32, |sum, k0| {
                let k1 = (k0 + tap.max(1)).min(patch.len());
                sum.wrapping_add(pairwise(patch, &weight, k0, k1))
            }),
    }
}

/// Receptive field of output `(b, dy, dx)` in group `g`, padding taps set to `zero`.
#[allow(clippy::too_many_arguments)]
fn patch_row(p: &ConvParam, src: &[u8], b: usize, dy: usize, dx: usize, g: usize, zero: u8, row: &mut Vec<u8>) {
    let gc = p.group_src_c();
    row.clear();
    for ky in 0..p.kernel_y {
        let sy = (dy * p.stride_y + ky * p.dilation_y) as isize - p.pad_y as isize;
        for kx in 0..p.kernel_x {
            let sx = (dx * p.stride_x + kx * p.dilation_x) as isize - p.pad_x as isize;
            if sy < 0 || sx < 0 || sy >= p.src_h as isize || sx >= p.src_w as isize {
                row.extend(std::iter::repeat(zero).take(gc));
            } else {
                let o = ((b * p.src_h + sy as usize) * p.src_w + sx as usize) * p.src_c + g * gc;
                row.extend_from_slice(&src[o..o + gc]);
            }
        }
    }
}

/// Integer convolution over NHWC `src` with `[ky, kx, src_c / group, dst_c]`
/// weights, accumulated the way `mode` says.
pub fn conv_reference(
    p: &ConvParam,
    src: &[u8],
    weight: &[i8],
    ctx: &QuantizationContext,
    mode: Accumulation,
    dst: &mut [u8],
) {
    assert!(src.len() >= p.src_size() && dst.len() >= p.dst_size());
    let n = p.group_dst_c();
    let (dst_h, dst_w) = (p.dst_h(), p.dst_w());
    let mut row = Vec::with_capacity(p.contraction());
    for b in 0..p.batch {
        for dy in 0..dst_h {
            for dx in 0..dst_w {
                let out = &mut dst[((b * dst_h + dy) * dst_w + dx) * p.dst_c..][..p.dst_c];
                for g in 0..p.group {
                    patch_row(p, src, b, dy, dx, g, ctx.src.zero, &mut row);
                    for j in 0..n {
                        let c = g * n + j;
                        let sum = dot(&row, |k| weight[k * p.dst_c + c], mode, p.group_src_c());
                        out[c] = ctx.requantize(sum, c);
                    }
                }
            }
        }
    }
}

/// Integer `A[m, k] x B` with B stored `[k, n]`, or `[n, k]` when `trans_b`.
pub fn gemm_reference(p: &GemmParam, a: &[u8], b: &[i8], ctx: &QuantizationContext, dst: &mut [u8]) {
    for i in 0..p.m {
        let row = &a[i * p.k..(i + 1) * p.k];
        for j in 0..p.n {
            let sum = if p.trans_b {
                dot(row, |k| b[j * p.k + k], Accumulation::Pairwise, p.k)
            } else {
                dot(row, |k| b[k * p.n + j], Accumulation::Pairwise, p.k)
            };
            dst[i * p.n + j] = ctx.requantize(sum, j);
        }
    }
}

/// Row-major `c[m, n] = a[m, k] * b`, where `b` has row stride `ldb`.
#[allow(clippy::too_many_arguments)]
fn float_gemm(m: usize, k: usize, n: usize, a: &[f32], b: &[f32], ldb: usize, c: &mut [f32], ldc: usize) {
    assert!(a.len() >= m * k && c.len() >= (m.max(1) - 1) * ldc + n);
    assert!(k == 0 || b.len() >= (k - 1) * ldb + n);
    unsafe {
        sgemm(
            m,
            k,
            n,
            1.0,
            a.as_ptr(),
            k as isize,
            1,
            b.as_ptr(),
            ldb as isize,
            1,
            0.0,
            c.as_mut_ptr(),
            ldc as isize,
            1,
        );
    }
}

fn requantize_float(ctx: &QuantizationContext, acc: &[f32], bias: Option<&[i32]>, ld: usize, dst: &mut [u8]) {
    for (i, (out, &v)) in dst.iter_mut().zip(acc).enumerate() {
        let c = i % ld;
        let b = bias.map_or(0.0, |b| b[c] as f32 * ctx.src.scale * ctx.weight_scale[c]);
        let a = activate(ctx.activation, v + b, &ctx.params, c);
        *out = (round(a / ctx.dst.scale) + ctx.dst.zero as f32).clamp(0.0, 255.0) as u8;
    }
}

/// Float pipeline for a convolution: dequantize, im2col, sgemm, bias,
/// activation, requantize. `bias` is the raw i32 bias before folding.
pub fn conv_float_reference(
    p: &ConvParam,
    src: &[u8],
    weight: &[i8],
    bias: Option<&[i32]>,
    ctx: &QuantizationContext,
) -> Vec<u8> {
    let m = p.batch * p.dst_h() * p.dst_w();
    let k = p.contraction();
    let n = p.group_dst_c();
    let wf: Vec<f32> = weight
        .iter()
        .enumerate()
        .map(|(i, &w)| w as f32 * ctx.weight_scale[i % p.dst_c])
        .collect();
    let mut acc = vec![0f32; m * p.dst_c];
    let mut patches = vec![0f32; m * k];
    let mut row = Vec::with_capacity(k);
    for g in 0..p.group {
        let mut i = 0;
        for b in 0..p.batch {
            for dy in 0..p.dst_h() {
                for dx in 0..p.dst_w() {
                    patch_row(p, src, b, dy, dx, g, ctx.src.zero, &mut row);
                    for (dst, &q) in patches[i * k..(i + 1) * k].iter_mut().zip(&row) {
                        *dst = ctx.src.dequantize(q);
                    }
                    i += 1;
                }
            }
        }
        float_gemm(m, k, n, &patches, &wf[g * n..], p.dst_c, &mut acc[g * n..], p.dst_c);
    }
    let mut dst = vec![0u8; m * p.dst_c];
    requantize_float(ctx, &acc, bias, p.dst_c, &mut dst);
    dst
}

/// Float pipeline for a matrix product, see [`conv_float_reference`].
pub fn gemm_float_reference(
    p: &GemmParam,
    a: &[u8],
    b: &[i8],
    bias: Option<&[i32]>,
    ctx: &QuantizationContext,
) -> Vec<u8> {
    let af: Vec<f32> = a.iter().map(|&q| ctx.src.dequantize(q)).collect();
    let mut bf = vec![0f32; p.k * p.n];
    for kk in 0..p.k {
        for j in 0..p.n {
            let w = if p.trans_b { b[j * p.k + kk] } else { b[kk * p.n + j] };
            bf[kk * p.n + j] = w as f32 * ctx.weight_scale[j];
        }
    }
    let mut acc = vec![0f32; p.m * p.n];
    float_gemm(p.m, p.k, p.n, &af, &bf, p.n, &mut acc, p.n);
    let mut dst = vec![0u8; p.m * p.n];
    requantize_float(ctx, &acc, bias, p.n, &mut dst);
    dst
}
