#[cfg(feature = "cuda-kernels")]
pub mod cuda_kernels;
pub mod device;
pub mod error;
pub mod moe;
