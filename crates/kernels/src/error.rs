use candle_core::{DType, DeviceLocation};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("shape mismatch: routed input {routed:?}, shared input {shared:?}")]
    ShapeMismatch {
        routed: Vec<usize>,
        shared: Vec<usize>,
    },

    #[error("hidden dimension must be non-zero")]
    EmptyHiddenDim,

    #[error("dtype mismatch: routed input {routed:?}, shared input {shared:?}")]
    DTypeMismatch { routed: DType, shared: DType },

    #[error("inputs must reside on the same device: routed on {routed:?}, shared on {shared:?}")]
    DeviceMismatch {
        routed: DeviceLocation,
        shared: DeviceLocation,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_shape_mismatch() {
        let e = KernelError::ShapeMismatch {
            routed: vec![2, 8],
            shared: vec![2, 4],
        };
        assert_eq!(
            e.to_string(),
            "shape mismatch: routed input [2, 8], shared input [2, 4]"
        );
    }

    #[test]
    fn error_display_empty_hidden_dim() {
        let e = KernelError::EmptyHiddenDim;
        assert_eq!(e.to_string(), "hidden dimension must be non-zero");
    }

    #[test]
    fn error_display_dtype_mismatch() {
        let e = KernelError::DTypeMismatch {
            routed: DType::F32,
            shared: DType::F16,
        };
        assert_eq!(
            e.to_string(),
            "dtype mismatch: routed input F32, shared input F16"
        );
    }
}
