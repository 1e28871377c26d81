pub mod gemm;
pub use gemm::*;
