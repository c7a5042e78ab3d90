//! Mixture of Experts (MoE) kernels.
//!
//! Elementwise ops used when assembling the output of an MoE layer.
//!
//! ## Submodules
//!
//! - [`mul_add`]: fused scale-and-combine of routed and shared expert
//!   outputs
//!
//! ## Feature Flags
//!
//! - `cuda-kernels`: launch the fused PTX kernels on CUDA devices instead
//!   of falling back to composite candle ops

mod mul_add;

pub use mul_add::mul_add;
