//! Quantized u8 x i8 convolution and inner-product kernels.
//!
//! Activations are u8 with a scale and zero-point, weights are i8 with one
//! scale per output channel. Results are requantized to u8 through a fused
//! bias, activation and rounding epilogue.

pub mod conv;
pub mod error;
pub mod inner_product;
pub mod kernels;
pub mod tensor;

pub use conv::{ConvOptions, ConvWeights, IoQuant, QuantizedConvolution, Variant};
pub use error::{QuantError, Result};
pub use inner_product::QuantizedInnerProduct;
pub use kernels::{ActivationKind, CacheSizes, ConvParam, ElementKind, GemmParam, Quant, Tier};
pub use tensor::TensorView;
