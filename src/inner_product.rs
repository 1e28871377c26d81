//! Quantized inner product: `C[m, n] = A[m, k] x B`, u8 activations, i8
//! weights, per-column scale and bias. Runs on the same packer, row stager
//! and blocked engine as the GEMM convolution.

use std::sync::Arc;

use crate::conv::{ConvOptions, ConvWeights, IoQuant};
use crate::error::{check_len, Result};
use crate::kernels::gemm::GemmTask;
use crate::kernels::pack::{weight_sums, PackedWeight, WeightLayout};
use crate::kernels::plan::MICRO_K;
use crate::kernels::staging::MatrixRows;
use crate::kernels::{utils, BlockPlan, GemmParam, KernelSet, QuantizationContext, Tier};

#[derive(Debug, Clone)]
pub struct QuantizedInnerProduct {
    param: GemmParam,
    options: ConvOptions,
    kernels: Arc<dyn KernelSet>,
    ctx: QuantizationContext,
    plan: BlockPlan,
    packed: PackedWeight,
}

impl QuantizedInnerProduct {
    /// `weights.weight` is `[k, n]`, or `[n, k]` when `param.trans_b` is set.
    pub fn new(param: GemmParam, io: IoQuant, weights: ConvWeights<'_>, options: &ConvOptions) -> Result<Self> {
        param.validate()?;
        Self::build(param, options.clone(), options.kernels(), io, weights)
    }

    fn build(
        param: GemmParam,
        options: ConvOptions,
        kernels: Arc<dyn KernelSet>,
        io: IoQuant,
        weights: ConvWeights<'_>,
    ) -> Result<Self> {
        check_len("weight", param.k * param.n, weights.weight.len())?;
        let layout = if param.trans_b {
            WeightLayout::NxK { ld: param.k }
        } else {
            WeightLayout::KxN {
                ld: param.n,
                col_offset: 0,
            }
        };
        let ctx = QuantizationContext::new(
            io.src,
            io.dst,
            io.intermediate,
            weights.weight_scale,
            weights.bias,
            &weight_sums(weights.weight, layout, param.k, param.n),
            param.activation,
            weights.activation_params,
        )?;
        let plan = BlockPlan::for_gemm(&param, kernels.lanes(), kernels.micro_rows(), &options.cache);
        let packed = kernels.pack(weights.weight, layout, &plan);
        Ok(Self {
            param,
            options,
            kernels,
            ctx,
            plan,
            packed,
        })
    }

    pub fn with_params(&self, io: IoQuant, weights: ConvWeights<'_>) -> Result<Self> {
        Self::build(self.param.clone(), self.options.clone(), self.kernels.clone(), io, weights)
    }

    pub fn set_params(&mut self, io: IoQuant, weights: ConvWeights<'_>) -> Result<()> {
        *self = self.with_params(io, weights)?;
        Ok(())
    }

    pub fn param(&self) -> &GemmParam {
        &self.param
    }

    pub fn plan(&self) -> &BlockPlan {
        &self.plan
    }

    pub fn context(&self) -> &QuantizationContext {
        &self.ctx
    }

    pub fn tier(&self) -> Tier {
        self.kernels.tier()
    }

    pub fn describe(&self) -> String {
        format!("{}::Gemm", self.kernels.tier())
    }

    fn task(&self) -> GemmTask<'_> {
        GemmTask {
            plan: &self.plan,
            packed: &self.packed,
            ctx: &self.ctx,
            kernels: &*self.kernels,
            dst_pitch: self.param.n,
            channel_offset: 0,
        }
    }

    pub fn external_buffer_size(&self) -> usize {
        self.task()
            .scratch_len(self.param.m, self.param.k % MICRO_K == 0)
    }

    pub fn forward(&self, a: &[u8], buf: Option<&mut [u8]>, dst: &mut [u8]) {
        self.forward_rows(a, buf, dst, 0, self.param.m);
    }

    /// Computes rows `m_beg..m_end` of the output.
    pub fn forward_rows(&self, a: &[u8], buf: Option<&mut [u8]>, dst: &mut [u8], m_beg: usize, m_end: usize) {
        let p = &self.param;
        assert!(a.len() >= p.m * p.k, "A holds {} bytes, need {}", a.len(), p.m * p.k);
        assert!(dst.len() >= p.m * p.n, "C holds {} bytes, need {}", dst.len(), p.m * p.n);
        assert!(m_beg <= m_end && m_end <= p.m, "bad row range {m_beg}..{m_end}");
        let source = MatrixRows::new(&a[..p.m * p.k], p.k);
        let need = self.external_buffer_size();
        let task = self.task();
        match buf {
            Some(buf) => {
                assert!(buf.len() >= need, "scratch holds {} bytes, need {need}", buf.len());
                task.forward(&source, m_beg, m_end, buf, dst);
            }
            None => utils::with_scratch(need, |buf| task.forward(&source, m_beg, m_end, buf, dst)),
        }
    }
}
