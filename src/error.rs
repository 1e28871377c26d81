use thiserror::Error;
use crate::kernels::params::ElementKind;
/// Configuration errors detected while building a convolution or inner product.
///
/// Anything returned here means "this operation is unavailable for this
/// configuration"; callers are expected to fall back to a generic path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuantError {
    #[error("unsupported element kinds: src {src:?}, dst {dst:?} (only u8 -> u8 is implemented)")]
    UnsupportedElementKind { src: ElementKind, dst: ElementKind },
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error("{what}: expected {expected} values, got {actual}")]
    ParamLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid scale for {what}: {value}")]
    InvalidScale { what: &'static str, value: f32 },
    #[error("variant {0} is not applicable to this convolution")]
    UnsupportedVariant(&'static str),
}
pub type Result<T> = std::result::Result<T, QuantError>;
pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(QuantError::ParamLength {
            what,
            expected,
            actual,
        })
    }
}
pub(crate) fn check_scale(what: &'static str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(QuantError::InvalidScale { what, value })
    }
}
