use crate::kernels::pack::WeightLayout;
/// Affine u8 quantization: `real = (stored - zero) * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quant {
    pub scale: f32,
    pub zero: u8,
}
impl Quant {
    pub fn new(scale: f32, zero: u8) -> Self {
        Self { scale, zero }
    }
    /// Quantization covering `[min, max]` (widened to include 0.0).
    pub fn from_range(min: f32, max: f32) -> Self {
        let lo = min.min(0.0);
        let hi = max.max(0.0);
        let scale = ((hi - lo) / 255.0).max(f32::EPSILON);
        let zero = round(-lo / scale).clamp(0.0, 255.0) as u8;
        Self { scale, zero }
    }
    #[inline]
    pub fn quantize(&self, x: f32) -> u8 {
        (round(x / self.scale) + self.zero as f32).clamp(0.0, 255.0) as u8
    }
    #[inline]
    pub fn dequantize(&self, q: u8) -> f32 {
        (q as i32 - self.zero as i32) as f32 * self.scale
    }
}
/// Round half to even, matching the default SIMD conversion mode.
#[inline]
pub fn round(x: f32) -> f32 {
    x.round_ties_even()
}
pub fn quantize_u8(x: &[f32], q: Quant) -> Vec<u8> {
    x.iter().map(|&v| q.quantize(v)).collect()
}
pub fn dequantize_u8(x: &[u8], q: Quant) -> Vec<f32> {
    x.iter().map(|&v| q.dequantize(v)).collect()
}
/// Per-output-channel symmetric i8 quantization of a `k x n` weight matrix.
///
/// With `overflow_safe` the weights are limited to `[-64, 63]` so that two
/// adjacent u8 x i8 products never leave the i16 range.
pub fn quantize_weights(
    w: &[f32],
    layout: WeightLayout,
    k: usize,
    n: usize,
    overflow_safe: bool,
) -> (Vec<i8>, Vec<f32>) {
    let range = if overflow_safe { 63.0 } else { 127.0 };
    let index = |kk: usize, j: usize| match layout {
        WeightLayout::KxN { ld, col_offset } => kk * ld + col_offset + j,
        WeightLayout::NxK { ld } => j * ld + kk,
    };
    let mut out = vec![0i8; w.len()];
    let mut scales = Vec::with_capacity(n);
    for j in 0..n {
        let max = (0..k).map(|kk| w[index(kk, j)].abs()).fold(0.0f32, f32::max);
        let scale = if max > 0.0 { max / range } else { 1.0 };
        for kk in 0..k {
            let q = round(w[index(kk, j)] / scale).clamp(-range - 1.0, range);
            out[index(kk, j)] = q as i8;
        }
        scales.push(scale);
    }
    (out, scales)
}
/// `round(b / (src_scale * weight_scale[c]))` per output channel.
pub fn quantize_bias(bias: &[f32], src_scale: f32, weight_scale: &[f32]) -> Vec<i32> {
    bias.iter()
        .zip(weight_scale)
        .map(|(&b, &ws)| round(b / (src_scale * ws)) as i32)
        .collect()
}
