pub mod activations;
#[cfg(target_arch = "x86_64")]
pub mod avx;
pub mod cache;
pub mod depthwise;
pub mod direct;
pub mod epilogue;
pub mod gemm;
pub mod micro;
#[cfg(target_arch = "aarch64")]
pub mod neon;
pub mod pack;
pub mod params;
pub mod plan;
pub mod quantize;
pub mod reference;
pub mod staging;
pub mod strategy;
pub mod tier;
pub mod utils;
pub use cache::CacheSizes;
pub use epilogue::QuantizationContext;
pub use pack::{pack_depthwise, pack_direct, pack_weight, weight_sums, DepthwiseWeight, PackedWeight, WeightLayout};
pub use params::{ActivationKind, ConvParam, ElementKind, GemmParam};
pub use plan::{BlockPlan, ReorderType};
pub use quantize::{dequantize_u8, quantize_bias, quantize_u8, quantize_weights, Quant};
pub use reference::{conv_float_reference, Accumulation, conv_reference, gemm_float_reference, gemm_reference};
pub use strategy::{select, KernelSet, ReferenceKernels};
pub use tier::Tier;
