//! Quantized NHWC convolution front-end.
//!
//! A `QuantizedConvolution` is built once per layer: it validates the shape,
//! picks a kernel family and a variant, packs the weights and folds the
//! source zero-point into the bias. After that it is immutable and can be
//! shared between threads; every call gets its own scratch.

use std::fmt;
use std::sync::Arc;

use crate::error::{check_len, QuantError, Result};
use crate::kernels::depthwise::DepthwiseTask;
use crate::kernels::direct::DirectTask;
use crate::kernels::gemm::GemmTask;
use crate::kernels::pack::{pack_depthwise, pack_direct, weight_sums, DepthwiseWeight, PackedWeight, WeightLayout};
use crate::kernels::staging::{ConvPatch, PatchSource};
use crate::kernels::{
    self, utils, Accumulation, BlockPlan, CacheSizes, ConvParam, KernelSet, Quant, QuantizationContext, Tier,
};
use crate::tensor::TensorView;

/// Algorithm used for a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Patch staging plus the blocked GEMM engine; handles every shape.
    NhwcGemm,
    /// Micro-kernels reading a ring of padded input rows tap by tap, for
    /// non-grouped convolutions with few input channels.
    NhwcDirect,
    /// Direct depthwise convolution, any kernel, stride and dilation.
    NhwcDepthwise,
    /// Depthwise 3x3 with dilation 1, unchecked interior.
    NhwcDepthwise3x3,
    /// Depthwise over a ring of padded, widened input rows.
    NhwcDepthwiseCyclic,
}

impl Variant {
    pub fn name(self) -> &'static str {
        match self {
            Variant::NhwcGemm => "NhwcGemm",
            Variant::NhwcDirect => "NhwcDirect",
            Variant::NhwcDepthwise => "NhwcDepthwise",
            Variant::NhwcDepthwise3x3 => "NhwcDepthwise3x3",
            Variant::NhwcDepthwiseCyclic => "NhwcDepthwiseCyclic",
        }
    }

    pub fn is_depthwise(self) -> bool {
        matches!(
            self,
            Variant::NhwcDepthwise | Variant::NhwcDepthwise3x3 | Variant::NhwcDepthwiseCyclic
        )
    }

    /// How this variant's engine sums products; the integer reference
    /// reproduces it bit for bit.
    pub fn accumulation(self) -> Accumulation {
        match self {
            Variant::NhwcGemm => Accumulation::Pairwise,
            Variant::NhwcDirect => Accumulation::PairwisePerTap,
            Variant::NhwcDepthwise | Variant::NhwcDepthwise3x3 | Variant::NhwcDepthwiseCyclic => Accumulation::Exact,
        }
    }

    /// Whether this variant can run `p`. Depthwise variants also accept a
    /// single-channel convolution.
    pub fn supports(self, p: &ConvParam) -> bool {
        let channelwise = p.group == p.src_c && p.group == p.dst_c;
        match self {
            Variant::NhwcGemm => true,
            Variant::NhwcDirect => p.group == 1,
            Variant::NhwcDepthwise | Variant::NhwcDepthwiseCyclic => channelwise,
            Variant::NhwcDepthwise3x3 => channelwise && p.is_kernel(3) && p.is_dilation(1),
        }
    }

    /// Default choice for `p` with `lanes`-wide tiles. Spatial kernels over at
    /// most `lanes / 2` input channels skip patch staging.
    pub fn select(p: &ConvParam, lanes: usize) -> Variant {
        if !p.is_depthwise() {
            if p.group == 1 && !p.is_1x1() && 2 * p.src_c <= lanes {
                Variant::NhwcDirect
            } else {
                Variant::NhwcGemm
            }
        } else if Variant::NhwcDepthwise3x3.supports(p) {
            Variant::NhwcDepthwise3x3
        } else if p.is_dilation(1) && p.src_c <= 4 * lanes {
            Variant::NhwcDepthwiseCyclic
        } else {
            Variant::NhwcDepthwise
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Construction-time knobs. `Default` uses the detected tier and cache sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvOptions {
    pub tier: Tier,
    /// Tile width of the portable kernels; SIMD families ignore it.
    pub lanes: Option<usize>,
    pub micro_rows: Option<usize>,
    pub cache: CacheSizes,
    /// Forces a variant instead of the heuristic choice.
    pub variant: Option<Variant>,
}

impl Default for ConvOptions {
    fn default() -> Self {
        Self {
            tier: Tier::detect(),
            lanes: None,
            micro_rows: None,
            cache: CacheSizes::get(),
            variant: None,
        }
    }
}

impl ConvOptions {
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }
    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = Some(lanes);
        self
    }
    pub fn with_micro_rows(mut self, rows: usize) -> Self {
        self.micro_rows = Some(rows);
        self
    }
    pub fn with_cache(mut self, cache: CacheSizes) -> Self {
        self.cache = cache;
        self
    }
    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = Some(variant);
        self
    }

    pub(crate) fn kernels(&self) -> Arc<dyn KernelSet> {
        kernels::select(self.tier, self.lanes, self.micro_rows)
    }
}

/// Source, destination and optional intermediate quantization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IoQuant {
    pub src: Quant,
    pub dst: Quant,
    /// Domain of the pre-activation requantization; defaults to `dst`.
    pub intermediate: Option<Quant>,
}

impl IoQuant {
    pub fn new(src: Quant, dst: Quant) -> Self {
        Self {
            src,
            dst,
            intermediate: None,
        }
    }
    pub fn with_intermediate(mut self, q: Quant) -> Self {
        self.intermediate = Some(q);
        self
    }
}

/// Raw i8 weights and what goes with them.
#[derive(Debug, Clone, Copy)]
pub struct ConvWeights<'a> {
    /// `[kernel_y, kernel_x, src_c / group, dst_c]`.
    pub weight: &'a [i8],
    /// One scale per output channel.
    pub weight_scale: &'a [f32],
    /// i32 bias in `src.scale * weight_scale[c]` units.
    pub bias: Option<&'a [i32]>,
    /// Empty for the activation defaults, one slope per channel for Prelu.
    pub activation_params: &'a [f32],
}

impl<'a> ConvWeights<'a> {
    pub fn new(weight: &'a [i8], weight_scale: &'a [f32]) -> Self {
        Self {
            weight,
            weight_scale,
            bias: None,
            activation_params: &[],
        }
    }
    pub fn with_bias(mut self, bias: &'a [i32]) -> Self {
        self.bias = Some(bias);
        self
    }
    pub fn with_activation_params(mut self, params: &'a [f32]) -> Self {
        self.activation_params = params;
        self
    }
}

#[derive(Debug, Clone)]
enum Engine {
    Gemm {
        plan: BlockPlan,
        /// One packed matrix per group.
        packed: Vec<PackedWeight>,
        direct: bool,
    },
    Direct {
        packed: PackedWeight,
    },
    Depthwise {
        weight: DepthwiseWeight,
    },
}

#[derive(Debug, Clone)]
pub struct QuantizedConvolution {
    param: ConvParam,
    variant: Variant,
    options: ConvOptions,
    kernels: Arc<dyn KernelSet>,
    ctx: QuantizationContext,
    engine: Engine,
}

impl QuantizedConvolution {
    pub fn new(param: ConvParam, io: IoQuant, weights: ConvWeights<'_>, options: &ConvOptions) -> Result<Self> {
        param.validate()?;
        let kernels = options.kernels();
        let variant = match options.variant {
            Some(v) if !v.supports(&param) => return Err(QuantError::UnsupportedVariant(v.name())),
            Some(v) => v,
            None => Variant::select(&param, kernels.lanes()),
        };
        Self::build(param, variant, options.clone(), kernels, io, weights)
    }

    fn build(
        param: ConvParam,
        variant: Variant,
        options: ConvOptions,
        kernels: Arc<dyn KernelSet>,
        io: IoQuant,
        weights: ConvWeights<'_>,
    ) -> Result<Self> {
        check_len("weight", param.weight_size(), weights.weight.len())?;
        let k = param.contraction();
        let full = WeightLayout::KxN {
            ld: param.dst_c,
            col_offset: 0,
        };
        let sums = weight_sums(weights.weight, full, k, param.dst_c);
        let ctx = QuantizationContext::new(
            io.src,
            io.dst,
            io.intermediate,
            weights.weight_scale,
            weights.bias,
            &sums,
            param.activation,
            weights.activation_params,
        )?;
        let taps = param.kernel_y * param.kernel_x;
        let engine = if variant.is_depthwise() {
            Engine::Depthwise {
                weight: pack_depthwise(weights.weight, taps, param.dst_c, kernels.lanes()),
            }
        } else if variant == Variant::NhwcDirect {
            Engine::Direct {
                packed: pack_direct(weights.weight, taps, param.src_c, param.dst_c, kernels.lanes()),
            }
        } else {
            let plan = BlockPlan::for_conv(&param, kernels.lanes(), kernels.micro_rows(), &options.cache);
            let n = param.group_dst_c();
            let packed = (0..param.group)
                .map(|g| {
                    let layout = WeightLayout::KxN {
                        ld: param.dst_c,
                        col_offset: g * n,
                    };
                    kernels.pack(weights.weight, layout, &plan)
                })
                .collect();
            let direct = ConvPatch::new(&param, &[], 0, 0).direct().is_some();
            Engine::Gemm { plan, packed, direct }
        };
        log::debug!("{}::{} for {}", kernels.tier(), variant, param);
        Ok(Self {
            param,
            variant,
            options,
            kernels,
            ctx,
            engine,
        })
    }

    /// Same shape, variant and kernels with new weights and quantization.
    pub fn with_params(&self, io: IoQuant, weights: ConvWeights<'_>) -> Result<Self> {
        Self::build(
            self.param.clone(),
            self.variant,
            self.options.clone(),
            self.kernels.clone(),
            io,
            weights,
        )
    }

    /// Replaces weights and quantization in place; on error `self` is unchanged.
    pub fn set_params(&mut self, io: IoQuant, weights: ConvWeights<'_>) -> Result<()> {
        *self = self.with_params(io, weights)?;
        Ok(())
    }

    pub fn param(&self) -> &ConvParam {
        &self.param
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn tier(&self) -> Tier {
        self.kernels.tier()
    }

    pub fn context(&self) -> &QuantizationContext {
        &self.ctx
    }

    /// Blocking of the GEMM variant.
    pub fn plan(&self) -> Option<&BlockPlan> {
        match &self.engine {
            Engine::Gemm { plan, .. } => Some(plan),
            Engine::Direct { .. } | Engine::Depthwise { .. } => None,
        }
    }

    /// `"<Tier>::<Variant>"`, e.g. `"Avx2::NhwcGemm"`.
    pub fn describe(&self) -> String {
        format!("{}::{}", self.kernels.tier(), self.variant)
    }

    /// Scratch bytes `forward` and `forward_rows` need from a caller buffer.
    pub fn external_buffer_size(&self) -> usize {
        match &self.engine {
            Engine::Gemm { plan, packed, direct } => {
                self.gemm_task(plan, &packed[0], 0)
                    .scratch_len(plan.batch * plan.positions(), *direct)
            }
            Engine::Direct { packed } => self.direct_task(packed).scratch_len(),
            Engine::Depthwise { weight } => {
                let task = self.depthwise_task(weight);
                match self.variant {
                    Variant::NhwcDepthwiseCyclic => task.cyclic_scratch_len(),
                    _ => task.scratch_len(),
                }
            }
        }
    }

    /// Convolves the whole batch. `buf` must hold `external_buffer_size()`
    /// bytes; `None` uses a thread-local scratch.
    pub fn forward(&self, src: &[u8], buf: Option<&mut [u8]>, dst: &mut [u8]) {
        self.forward_rows(src, buf, dst, 0, self.param.dst_h());
    }

    /// Computes output rows `y_beg..y_end` of every image; other rows of
    /// `dst` are left untouched. Disjoint row ranges may run concurrently
    /// on the same instance with separate scratch.
    pub fn forward_rows(&self, src: &[u8], buf: Option<&mut [u8]>, dst: &mut [u8], y_beg: usize, y_end: usize) {
        let p = &self.param;
        assert!(src.len() >= p.src_size(), "src holds {} bytes, need {}", src.len(), p.src_size());
        assert!(dst.len() >= p.dst_size(), "dst holds {} bytes, need {}", dst.len(), p.dst_size());
        assert!(y_beg <= y_end && y_end <= p.dst_h(), "bad row range {y_beg}..{y_end}");
        if y_beg == y_end {
            return;
        }
        let need = self.external_buffer_size();
        match buf {
            Some(buf) => {
                assert!(buf.len() >= need, "scratch holds {} bytes, need {need}", buf.len());
                self.run(src, buf, dst, y_beg, y_end);
            }
            None => utils::with_scratch(need, |buf| self.run(src, buf, dst, y_beg, y_end)),
        }
    }

    /// Convolves an NHWC tensor into a new tensor.
    pub fn forward_view(&self, src: &TensorView<'_, u8>) -> TensorView<'static, u8> {
        let p = &self.param;
        assert_eq!(&*src.shape, &[p.batch, p.src_h, p.src_w, p.src_c], "src shape");
        let mut out = vec![0u8; p.dst_size()];
        self.forward(&src.data, None, &mut out);
        TensorView::from_owned(out, vec![p.batch, p.dst_h(), p.dst_w(), p.dst_c])
    }

    fn gemm_task<'a>(&'a self, plan: &'a BlockPlan, packed: &'a PackedWeight, group: usize) -> GemmTask<'a> {
        GemmTask {
            plan,
            packed,
            ctx: &self.ctx,
            kernels: &*self.kernels,
            dst_pitch: self.param.dst_c,
            channel_offset: group * self.param.group_dst_c(),
        }
    }

    fn direct_task<'a>(&'a self, packed: &'a PackedWeight) -> DirectTask<'a> {
        DirectTask {
            param: &self.param,
            packed,
            ctx: &self.ctx,
            kernels: &*self.kernels,
        }
    }

    fn depthwise_task<'a>(&'a self, weight: &'a DepthwiseWeight) -> DepthwiseTask<'a> {
        DepthwiseTask {
            param: &self.param,
            weight,
            ctx: &self.ctx,
            kernels: &*self.kernels,
        }
    }

    fn run(&self, src: &[u8], buf: &mut [u8], dst: &mut [u8], y_beg: usize, y_end: usize) {
        let p = &self.param;
        let (src_img, dst_img) = (p.src_image_size(), p.dst_image_size());
        let dst_w = p.dst_w();
        log::trace!("{} rows {y_beg}..{y_end}", self.describe());
        match &self.engine {
            Engine::Gemm { plan, packed, .. } => {
                // whole images can be coalesced into one pass
                let images = if y_beg == 0 && y_end == p.dst_h() { plan.batch } else { 1 };
                for b0 in (0..p.batch).step_by(images) {
                    let nb = images.min(p.batch - b0);
                    let src = &src[b0 * src_img..(b0 + nb) * src_img];
                    let dst = &mut dst[b0 * dst_img..(b0 + nb) * dst_img];
                    let pos_beg = y_beg * dst_w;
                    let pos_end = (nb - 1) * plan.positions() + y_end * dst_w;
                    for (g, packed) in packed.iter().enumerate() {
                        let patch = ConvPatch::new(p, src, g, self.ctx.src.zero);
                        self.gemm_task(plan, packed, g)
                            .forward(&patch, pos_beg, pos_end, buf, dst);
                    }
                }
            }
            Engine::Direct { packed } => {
                self.direct_task(packed).forward(src, p.batch, y_beg, y_end, buf, dst);
            }
            Engine::Depthwise { weight } => {
                let task = self.depthwise_task(weight);
                for b in 0..p.batch {
                    let image = &src[b * src_img..(b + 1) * src_img];
                    let out = &mut dst[b * dst_img..(b + 1) * dst_img];
                    match self.variant {
                        Variant::NhwcDepthwise3x3 => task.forward_3x3(image, y_beg, y_end, buf, out),
                        Variant::NhwcDepthwiseCyclic => task.forward_cyclic(image, y_beg, y_end, buf, out),
                        _ => task.forward_generic(image, y_beg, y_end, buf, out),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::ActivationKind;

    fn scalar() -> ConvOptions {
        ConvOptions::default().with_tier(Tier::Scalar)
    }

    #[test]
    fn test_variant_selection() {
        let dw3 = ConvParam::new(1, 32, 8, 8, 32, (3, 3)).with_group(32).with_pad(1, 1, 1, 1);
        assert_eq!(Variant::select(&dw3, 8), Variant::NhwcDepthwise3x3);
        let dw5 = ConvParam::new(1, 16, 8, 8, 16, (5, 5)).with_group(16);
        assert_eq!(Variant::select(&dw5, 8), Variant::NhwcDepthwiseCyclic);
        let wide = ConvParam::new(1, 128, 8, 8, 128, (5, 5)).with_group(128);
        assert_eq!(Variant::select(&wide, 8), Variant::NhwcDepthwise);
        let grouped = ConvParam::new(1, 16, 8, 8, 32, (3, 3)).with_group(4);
        assert_eq!(Variant::select(&grouped, 8), Variant::NhwcGemm);
        let stem = ConvParam::new(1, 3, 32, 32, 16, (3, 3)).with_stride(2, 2).with_pad(1, 1, 1, 1);
        assert_eq!(Variant::select(&stem, 8), Variant::NhwcDirect);
        assert_eq!(Variant::select(&stem, 4), Variant::NhwcGemm);
        let pointwise = ConvParam::new(1, 3, 8, 8, 16, (1, 1));
        assert_eq!(Variant::select(&pointwise, 8), Variant::NhwcGemm);
        assert!(!Variant::NhwcDirect.supports(&grouped));
        assert_eq!(Variant::NhwcDirect.accumulation(), Accumulation::PairwisePerTap);
        assert!(!Variant::NhwcDirect.is_depthwise());
    }

    #[test]
    fn test_forced_variant_must_apply() {
        let p = ConvParam::new(1, 8, 4, 4, 8, (3, 3));
        let w = vec![1i8; p.weight_size()];
        let scales = vec![1.0; 8];
        let io = IoQuant::new(Quant::new(1.0, 0), Quant::new(1.0, 0));
        let err = QuantizedConvolution::new(
            p,
            io,
            ConvWeights::new(&w, &scales),
            &scalar().with_variant(Variant::NhwcDepthwise),
        )
        .unwrap_err();
        assert_eq!(err, QuantError::UnsupportedVariant("NhwcDepthwise"));
    }

    #[test]
    fn test_describe_and_buffer_size() {
        let p = ConvParam::new(2, 8, 6, 6, 16, (3, 3)).with_pad(1, 1, 1, 1);
        let w = vec![0i8; p.weight_size()];
        let scales = vec![0.5; 16];
        let io = IoQuant::new(Quant::new(0.1, 3), Quant::new(0.2, 7));
        let conv = QuantizedConvolution::new(p, io, ConvWeights::new(&w, &scales), &scalar()).unwrap();
        assert_eq!(conv.describe(), "Scalar::NhwcGemm");
        assert!(conv.external_buffer_size() >= 36 * 72);
        let src = vec![5u8; conv.param().src_size()];
        let mut dst = vec![0u8; conv.param().dst_size()];
        conv.forward(&src, None, &mut dst);
        // all-zero weights leave only the destination zero-point
        assert!(dst.iter().all(|&v| v == 7));
    }

    #[test]
    fn test_set_params_rebuilds() {
        let p = ConvParam::new(1, 4, 3, 3, 4, (1, 1)).with_activation(ActivationKind::Relu);
        let zeros = vec![0i8; p.weight_size()];
        let ones = vec![1i8; p.weight_size()];
        let scales = vec![1.0; 4];
        let io = IoQuant::new(Quant::new(1.0, 0), Quant::new(1.0, 0));
        let mut conv = QuantizedConvolution::new(p, io, ConvWeights::new(&zeros, &scales), &scalar()).unwrap();
        let src = vec![2u8; conv.param().src_size()];
        let mut dst = vec![0u8; conv.param().dst_size()];
        conv.forward(&src, None, &mut dst);
        assert!(dst.iter().all(|&v| v == 0));
        conv.set_params(io, ConvWeights::new(&ones, &scales)).unwrap();
        conv.forward(&src, None, &mut dst);
        assert!(dst.iter().all(|&v| v == 8));
        let bad = conv.set_params(io, ConvWeights::new(&ones, &scales[..3]));
        assert!(matches!(bad, Err(QuantError::ParamLength { .. })));
        assert_eq!(conv.variant(), Variant::NhwcGemm);
    }

    #[test]
    fn test_direct_buffer_and_description() {
        let p = ConvParam::new(2, 2, 6, 5, 8, (3, 3)).with_pad(1, 1, 1, 1);
        let w = vec![1i8; p.weight_size()];
        let scales = vec![1.0; 8];
        let io = IoQuant::new(Quant::new(1.0, 3), Quant::new(1.0, 0));
        let conv = QuantizedConvolution::new(p, io, ConvWeights::new(&w, &scales), &scalar().with_lanes(8)).unwrap();
        assert_eq!(conv.describe(), "Scalar::NhwcDirect");
        assert!(conv.plan().is_none());
        // 4 ring rows of 7 padded pixels, channels padded to 4
        assert!(conv.external_buffer_size() >= 4 * 7 * 4);
        let src = vec![4u8; conv.param().src_size()];
        let mut dst = vec![0u8; conv.param().dst_size()];
        conv.forward(&src, None, &mut dst);
        // padding taps hold the zero-point, so each tap inside adds 2 * (4 - 3)
        let (dh, dw) = (conv.param().dst_h(), conv.param().dst_w());
        assert_eq!(dst[0], 8);
        assert_eq!(dst[(dw + 1) * 8], 18);
        assert_eq!(dst[((dh - 1) * dw + dw - 1) * 8 + 7], 8);
    }

    #[test]
    fn test_forward_view_shape() {
        let p = ConvParam::new(1, 4, 5, 5, 8, (3, 3)).with_stride(2, 2);
        let w = vec![1i8; p.weight_size()];
        let scales = vec![1.0; 8];
        let io = IoQuant::new(Quant::new(1.0, 0), Quant::new(4.0, 0));
        let conv = QuantizedConvolution::new(p, io, ConvWeights::new(&w, &scales), &scalar()).unwrap();
        let data = vec![1u8; 100];
        let shape = [1, 5, 5, 4];
        let out = conv.forward_view(&TensorView::new(&data, &shape));
        assert_eq!(&*out.shape, &[1, 2, 2, 8]);
        // 36 taps of 1 * 1, scaled by 1/4
        assert!(out.data.iter().all(|&v| v == 9));
    }
}
