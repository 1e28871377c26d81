//! Requantization of int32 accumulators into u8 outputs.
//!
//! Identity activation goes straight from the accumulator to the destination
//! domain. Any other activation first requantizes into an intermediate u8
//! domain, dequantizes that, applies the activation in float and requantizes
//! into the destination domain.

use crate::error::{check_len, check_scale, Result};
use crate::kernels::activations::{self, ActivationFn};
use crate::kernels::params::ActivationKind;
use crate::kernels::quantize::{round, Quant};

type RequantFn = fn(&QuantizationContext, i32, usize) -> u8;

/// Per-instance quantization state, fixed once weights are set.
#[derive(Debug, Clone)]
pub struct QuantizationContext {
    pub src: Quant,
    pub dst: Quant,
    pub intermediate: Quant,
    pub weight_scale: Vec<f32>,
    /// Bias with `-src.zero * sum(weight[.., c])` already folded in.
    pub bias: Vec<i32>,
    pub norm: Vec<f32>,
    pub activation: ActivationKind,
    pub params: Vec<f32>,
    dst_norm: f32,
    activate: ActivationFn,
    requant: RequantFn,
}

impl QuantizationContext {
    /// Builds the context for `weight_sums.len()` output channels.
    ///
    /// `intermediate` defaults to `dst`. `params` may be empty to use the
    /// activation defaults; parametric relu needs one slope per channel.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        src: Quant,
        dst: Quant,
        intermediate: Option<Quant>,
        weight_scale: &[f32],
        bias: Option<&[i32]>,
        weight_sums: &[i32],
        activation: ActivationKind,
        params: &[f32],
    ) -> Result<Self> {
        let channels = weight_sums.len();
        let intermediate = intermediate.unwrap_or(dst);
        check_scale("src", src.scale)?;
        check_scale("dst", dst.scale)?;
        check_scale("intermediate", intermediate.scale)?;
        check_len("weight scale", channels, weight_scale.len())?;
        for &ws in weight_scale {
            check_scale("weight", ws)?;
        }
        if let Some(b) = bias {
            check_len("bias", channels, b.len())?;
        }
        let params = match activation {
            ActivationKind::Prelu => {
                check_len("prelu slopes", channels, params.len())?;
                params.to_vec()
            }
            _ if params.is_empty() => activation.default_params().to_vec(),
            _ => {
                let mut p = activation.default_params().to_vec();
                for (dst, &v) in p.iter_mut().zip(params) {
                    *dst = v;
                }
                p
            }
        };
        let norm_scale = if activation.is_identity() {
            dst.scale
        } else {
            intermediate.scale
        };
        let norm = weight_scale
            .iter()
            .map(|&ws| src.scale * ws / norm_scale)
            .collect();
        let bias = (0..channels)
            .map(|c| {
                let raw = bias.map_or(0, |b| b[c]);
                raw.wrapping_sub((src.zero as i32).wrapping_mul(weight_sums[c]))
            })
            .collect();
        let requant: RequantFn = if activation.is_identity() {
            requant_identity
        } else {
            requant_activated
        };
        Ok(Self {
            src,
            dst,
            intermediate,
            weight_scale: weight_scale.to_vec(),
            bias,
            norm,
            activation,
            params,
            dst_norm: 1.0 / dst.scale,
            activate: activations::select(activation),
            requant,
        })
    }

    pub fn channels(&self) -> usize {
        self.bias.len()
    }

    /// Requantizes the accumulator of output channel `c`.
    #[inline]
    pub fn requantize(&self, sum: i32, c: usize) -> u8 {
        (self.requant)(self, sum, c)
    }

    /// Requantizes consecutive channels `c0..c0 + dst.len()`.
    #[inline]
    pub fn apply(&self, sums: &[i32], c0: usize, dst: &mut [u8]) {
        for (i, (out, &sum)) in dst.iter_mut().zip(sums).enumerate() {
            *out = (self.requant)(self, sum, c0 + i);
        }
    }
}

#[inline]
fn saturate_u8(x: f32) -> u8 {
    x.clamp(0.0, 255.0) as u8
}

fn requant_identity(ctx: &QuantizationContext, sum: i32, c: usize) -> u8 {
    let v = sum.wrapping_add(ctx.bias[c]) as f32 * ctx.norm[c];
    saturate_u8(round(v) + ctx.dst.zero as f32)
}

fn requant_activated(ctx: &QuantizationContext, sum: i32, c: usize) -> u8 {
    let v = sum.wrapping_add(ctx.bias[c]) as f32 * ctx.norm[c];
    let zero = ctx.intermediate.zero as f32;
    let i = (round(v) + zero).clamp(0.0, 255.0);
    let f = (i - zero) * ctx.intermediate.scale;
    let a = (ctx.activate)(f, &ctx.params, c);
    saturate_u8(round(a * ctx.dst_norm) + ctx.dst.zero as f32)
}
