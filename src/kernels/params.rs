use crate::error::{QuantError, Result};
use std::fmt;
/// Storage kind of an activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ElementKind {
    #[default]
    U8,
    F32,
}
/// Activation fused into the requantization epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ActivationKind {
    #[default]
    Identity,
    Relu,
    LeakyRelu,
    RestrictRange,
    Prelu,
    Elu,
    Hswish,
    Mish,
    HardSigmoid,
    Swish,
    Gelu,
}
impl ActivationKind {
    /// Shared parameters used when the caller passes none.
    pub fn default_params(self) -> [f32; 2] {
        match self {
            ActivationKind::LeakyRelu => [0.01, 0.0],
            ActivationKind::RestrictRange => [0.0, 6.0],
            ActivationKind::Elu => [1.0, 0.0],
            ActivationKind::Hswish => [3.0, 1.0 / 6.0],
            ActivationKind::Mish => [20.0, 0.0],
            ActivationKind::HardSigmoid => [1.0 / 6.0, 0.5],
            ActivationKind::Swish => [1.0, 0.0],
            _ => [0.0, 0.0],
        }
    }
    pub fn is_identity(self) -> bool {
        self == ActivationKind::Identity
    }
}
/// Immutable description of an NHWC convolution.
///
/// Weights are expected as `[kernel_y, kernel_x, src_c / group, dst_c]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvParam {
    pub batch: usize,
    pub src_c: usize,
    pub src_h: usize,
    pub src_w: usize,
    pub dst_c: usize,
    pub kernel_y: usize,
    pub kernel_x: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub dilation_y: usize,
    pub dilation_x: usize,
    pub pad_y: usize,
    pub pad_x: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub group: usize,
    pub activation: ActivationKind,
    pub src_kind: ElementKind,
    pub dst_kind: ElementKind,
}
impl ConvParam {
    pub fn new(
        batch: usize,
        src_c: usize,
        src_h: usize,
        src_w: usize,
        dst_c: usize,
        kernel: (usize, usize),
    ) -> Self {
        Self {
            batch,
            src_c,
            src_h,
            src_w,
            dst_c,
            kernel_y: kernel.0,
            kernel_x: kernel.1,
            stride_y: 1,
            stride_x: 1,
            dilation_y: 1,
            dilation_x: 1,
            pad_y: 0,
            pad_x: 0,
            pad_h: 0,
            pad_w: 0,
            group: 1,
            activation: ActivationKind::Identity,
            src_kind: ElementKind::U8,
            dst_kind: ElementKind::U8,
        }
    }
    pub fn with_stride(mut self, y: usize, x: usize) -> Self {
        self.stride_y = y;
        self.stride_x = x;
        self
    }
    pub fn with_dilation(mut self, y: usize, x: usize) -> Self {
        self.dilation_y = y;
        self.dilation_x = x;
        self
    }
    /// Padding as (top, left, bottom, right).
    pub fn with_pad(mut self, top: usize, left: usize, bottom: usize, right: usize) -> Self {
        self.pad_y = top;
        self.pad_x = left;
        self.pad_h = bottom;
        self.pad_w = right;
        self
    }
    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }
    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }
    pub fn with_kinds(mut self, src: ElementKind, dst: ElementKind) -> Self {
        self.src_kind = src;
        self.dst_kind = dst;
        self
    }
    fn out_extent(input: usize, pad: usize, kernel: usize, dilation: usize, stride: usize) -> usize {
        let span = dilation * (kernel - 1) + 1;
        let padded = input + pad;
        if padded < span || stride == 0 {
            0
        } else {
            (padded - span) / stride + 1
        }
    }
    pub fn dst_h(&self) -> usize {
        Self::out_extent(
            self.src_h,
            self.pad_y + self.pad_h,
            self.kernel_y.max(1),
            self.dilation_y,
            self.stride_y,
        )
    }
    pub fn dst_w(&self) -> usize {
        Self::out_extent(
            self.src_w,
            self.pad_x + self.pad_w,
            self.kernel_x.max(1),
            self.dilation_x,
            self.stride_x,
        )
    }
    pub fn group_src_c(&self) -> usize {
        self.src_c / self.group
    }
    pub fn group_dst_c(&self) -> usize {
        self.dst_c / self.group
    }
    /// Contraction length of one output value: `src_c / group * kernel_y * kernel_x`.
    pub fn contraction(&self) -> usize {
        self.group_src_c() * self.kernel_y * self.kernel_x
    }
    pub fn is_depthwise(&self) -> bool {
        self.group > 1 && self.group == self.src_c && self.group == self.dst_c
    }
    pub fn is_kernel(&self, k: usize) -> bool {
        self.kernel_y == k && self.kernel_x == k
    }
    pub fn is_dilation(&self, d: usize) -> bool {
        self.dilation_y == d && self.dilation_x == d
    }
    pub fn is_stride(&self, s: usize) -> bool {
        self.stride_y == s && self.stride_x == s
    }
    pub fn has_padding(&self) -> bool {
        self.pad_y + self.pad_x + self.pad_h + self.pad_w > 0
    }
    pub fn is_1x1(&self) -> bool {
        self.is_kernel(1) && self.is_stride(1) && !self.has_padding()
    }
    pub fn src_image_size(&self) -> usize {
        self.src_h * self.src_w * self.src_c
    }
    pub fn dst_image_size(&self) -> usize {
        self.dst_h() * self.dst_w() * self.dst_c
    }
    pub fn src_size(&self) -> usize {
        self.batch * self.src_image_size()
    }
    pub fn dst_size(&self) -> usize {
        self.batch * self.dst_image_size()
    }
    pub fn weight_size(&self) -> usize {
        self.contraction() * self.dst_c
    }
    pub fn validate(&self) -> Result<()> {
        if self.src_kind != ElementKind::U8 || self.dst_kind != ElementKind::U8 {
            return Err(QuantError::UnsupportedElementKind {
                src: self.src_kind,
                dst: self.dst_kind,
            });
        }
        let dims = [
            ("batch", self.batch),
            ("src_c", self.src_c),
            ("src_h", self.src_h),
            ("src_w", self.src_w),
            ("dst_c", self.dst_c),
            ("kernel_y", self.kernel_y),
            ("kernel_x", self.kernel_x),
            ("stride_y", self.stride_y),
            ("stride_x", self.stride_x),
            ("dilation_y", self.dilation_y),
            ("dilation_x", self.dilation_x),
            ("group", self.group),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(QuantError::InvalidShape(format!("{name} must be non-zero")));
        }
        if self.src_c % self.group != 0 || self.dst_c % self.group != 0 {
            return Err(QuantError::InvalidShape(format!(
                "group {} must divide src_c {} and dst_c {}",
                self.group, self.src_c, self.dst_c
            )));
        }
        if self.dst_h() == 0 || self.dst_w() == 0 {
            return Err(QuantError::InvalidShape(format!(
                "kernel {}x{} does not fit padded input for {}",
                self.kernel_y, self.kernel_x, self
            )));
        }
        Ok(())
    }
}
impl fmt::Display for ConvParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}x{}->{} k{}x{} s{}x{} d{}x{} p{},{},{},{} g{} {:?}",
            self.batch,
            self.src_h,
            self.src_w,
            self.src_c,
            self.dst_c,
            self.kernel_y,
            self.kernel_x,
            self.stride_y,
            self.stride_x,
            self.dilation_y,
            self.dilation_x,
            self.pad_y,
            self.pad_x,
            self.pad_h,
            self.pad_w,
            self.group,
            self.activation
        )
    }
}
/// Quantized matrix product `C[m, n] = A[m, k] * B[k, n]`, with B given as
/// `[n, k]` when `trans_b` is set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GemmParam {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub trans_b: bool,
    pub activation: ActivationKind,
    pub src_kind: ElementKind,
    pub dst_kind: ElementKind,
}
impl GemmParam {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self {
            m,
            n,
            k,
            trans_b: false,
            activation: ActivationKind::Identity,
            src_kind: ElementKind::U8,
            dst_kind: ElementKind::U8,
        }
    }
    pub fn with_trans_b(mut self, trans_b: bool) -> Self {
        self.trans_b = trans_b;
        self
    }
    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }
    pub fn with_kinds(mut self, src: ElementKind, dst: ElementKind) -> Self {
        self.src_kind = src;
        self.dst_kind = dst;
        self
    }
    pub fn validate(&self) -> Result<()> {
        if self.src_kind != ElementKind::U8 || self.dst_kind != ElementKind::U8 {
            return Err(QuantError::UnsupportedElementKind {
                src: self.src_kind,
                dst: self.dst_kind,
            });
        }
        if self.m == 0 || self.n == 0 || self.k == 0 {
            return Err(QuantError::InvalidShape(format!(
                "gemm {}x{}x{} has an empty dimension",
                self.m, self.n, self.k
            )));
        }
        Ok(())
    }
}
