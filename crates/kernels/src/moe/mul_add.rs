//! Fused multiply-add for combining routed and shared expert outputs.
//!
//! MoE models with shared experts (Qwen2-MoE, GLM4-MoE, DeepSeek) finish
//! each layer with `routed_output * routed_scaling_factor + shared_output`.
//! With stock tensor ops that is a scale, an add, and an intermediate
//! allocation; this module fuses it into a single pass over the batch.
//!
//! ## Algorithm
//!
//! `n_rows = min(batch_size, parallel_units)` workers cover the batch in a
//! grid-stride loop: worker `w` computes rows `w, w + n_rows, w + 2*n_rows, ...`
//! until the row index leaves the batch. Every row is written by exactly one
//! worker, so the output needs no synchronization. Columns at index
//! `>= hidden_size` are never read or written, which keeps non-power-of-two
//! widths correct on the blocked CUDA path.

use candle_core::{CpuStorage, CustomOp2, Device, Layout, Shape, Tensor};
use half::{bf16, f16};
use rayon::prelude::*;
use tracing::trace;

use crate::device::parallel_units;
use crate::error::KernelError;

/// Compute `routed_input * scaling_factor + shared_input` in one fused pass.
///
/// Both inputs must be rank-2 `[batch_size, hidden_size]` tensors of the
/// same float dtype on the same device. Returns a freshly allocated tensor
/// of the same shape, dtype and device; the inputs are never mutated.
///
/// Dispatch:
/// - CPU: grid-strided rayon workers over rows.
/// - CUDA with the `cuda-kernels` feature: one fused PTX kernel launch.
/// - Anything else: composite `affine` + `add` lowering via candle.
///
/// # Arguments
/// * `routed_input` - combined routed-expert output `[batch_size, hidden_size]`
/// * `shared_input` - shared-expert output, same shape and dtype
/// * `scaling_factor` - routed scaling factor, converted to the element dtype
///
/// # Example
/// ```ignore
/// let routed = Tensor::new(&[[1f32, 2.], [3., 4.]], &device)?;
/// let shared = Tensor::new(&[[10f32, 10.], [10., 10.]], &device)?;
/// let out = mul_add(&routed, &shared, 2.0)?;
/// // [[12, 14], [16, 18]]
/// ```
pub fn mul_add(
    routed_input: &Tensor,
    shared_input: &Tensor,
    scaling_factor: f64,
) -> Result<Tensor, KernelError> {
    let (batch_size, hidden_size) = routed_input.dims2()?;

    if routed_input.dims() != shared_input.dims() {
        return Err(KernelError::ShapeMismatch {
            routed: routed_input.dims().to_vec(),
            shared: shared_input.dims().to_vec(),
        });
    }
    if hidden_size == 0 {
        return Err(KernelError::EmptyHiddenDim);
    }
    if routed_input.dtype() != shared_input.dtype() {
        return Err(KernelError::DTypeMismatch {
            routed: routed_input.dtype(),
            shared: shared_input.dtype(),
        });
    }
    if !routed_input.device().same_device(shared_input.device()) {
        return Err(KernelError::DeviceMismatch {
            routed: routed_input.device().location(),
            shared: shared_input.device().location(),
        });
    }

    let routed = routed_input.contiguous()?;
    let shared = shared_input.contiguous()?;

    trace!(batch_size, hidden_size, scaling_factor, "mul_add dispatch");

    let op = MulAddOp {
        factor: scaling_factor,
    };
    match routed.device() {
        Device::Cpu => Ok(routed.apply_op2_no_bwd(&shared, &op)?),
        #[cfg(feature = "cuda-kernels")]
        Device::Cuda(_) => Ok(routed.apply_op2_no_bwd(&shared, &op)?),
        _ => {
            // No fused kernel for this device; lower to candle's elementwise ops.
            Ok(routed.affine(scaling_factor, 0.0)?.add(&shared)?)
        }
    }
}

struct MulAddOp {
    factor: f64,
}

impl CustomOp2 for MulAddOp {
    fn name(&self) -> &'static str {
        "mul_add"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let (batch_size, hidden_size) = l1.shape().dims2()?;
        let (start1, end1) = match l1.contiguous_offsets() {
            Some(offsets) => offsets,
            None => candle_core::bail!("mul_add: routed input must be contiguous"),
        };
        let (start2, end2) = match l2.contiguous_offsets() {
            Some(offsets) => offsets,
            None => candle_core::bail!("mul_add: shared input must be contiguous"),
        };

        let shape = l1.shape().clone();
        match (s1, s2) {
            (CpuStorage::F32(routed), CpuStorage::F32(shared)) => {
                let out = mul_add_rows(
                    &routed[start1..end1],
                    &shared[start2..end2],
                    self.factor as f32,
                    batch_size,
                    hidden_size,
                );
                Ok((CpuStorage::F32(out), shape))
            }
            (CpuStorage::F64(routed), CpuStorage::F64(shared)) => {
                let out = mul_add_rows(
                    &routed[start1..end1],
                    &shared[start2..end2],
                    self.factor,
                    batch_size,
                    hidden_size,
                );
                Ok((CpuStorage::F64(out), shape))
            }
            (CpuStorage::F16(routed), CpuStorage::F16(shared)) => {
                let out = mul_add_rows(
                    &routed[start1..end1],
                    &shared[start2..end2],
                    f16::from_f64(self.factor),
                    batch_size,
                    hidden_size,
                );
                Ok((CpuStorage::F16(out), shape))
            }
            (CpuStorage::BF16(routed), CpuStorage::BF16(shared)) => {
                let out = mul_add_rows(
                    &routed[start1..end1],
                    &shared[start2..end2],
                    bf16::from_f64(self.factor),
                    batch_size,
                    hidden_size,
                );
                Ok((CpuStorage::BF16(out), shape))
            }
            _ => candle_core::bail!("mul_add: expected two float tensors of the same dtype"),
        }
    }

    #[cfg(feature = "cuda-kernels")]
    fn cuda_fwd(
        &self,
        s1: &candle_core::CudaStorage,
        l1: &Layout,
        s2: &candle_core::CudaStorage,
        l2: &Layout,
    ) -> candle_core::Result<(candle_core::CudaStorage, Shape)> {
        crate::cuda_kernels::mul_add_cuda(self.factor, s1, l1, s2, l2)
    }
}

/// Grid-strided row loop shared by all element types.
///
/// Rows are dealt round-robin to `n_rows` buckets, so bucket `w` owns rows
/// `w, w + n_rows, w + 2*n_rows, ...`. Each bucket runs on one rayon worker
/// and holds the only mutable references to its rows; the inputs are read
/// through bounds-checked row slices, the CPU rendition of the column mask.
fn mul_add_rows<T>(
    routed: &[T],
    shared: &[T],
    factor: T,
    batch_size: usize,
    hidden_size: usize,
) -> Vec<T>
where
    T: Copy + Default + Send + Sync + std::ops::Mul<Output = T> + std::ops::Add<Output = T>,
{
    let mut output = vec![T::default(); batch_size * hidden_size];
    if batch_size == 0 {
        return output;
    }

    let n_rows = batch_size.min(parallel_units(&Device::Cpu)).max(1);
    let mut buckets: Vec<Vec<(usize, &mut [T])>> = (0..n_rows).map(|_| Vec::new()).collect();
    for (row_idx, out_row) in output.chunks_mut(hidden_size).enumerate() {
        buckets[row_idx % n_rows].push((row_idx, out_row));
    }

    buckets.into_par_iter().for_each(|rows| {
        for (row_idx, out_row) in rows {
            let offset = row_idx * hidden_size;
            let routed_row = &routed[offset..offset + hidden_size];
            let shared_row = &shared[offset..offset + hidden_size];
            for ((out, &r), &s) in out_row.iter_mut().zip(routed_row).zip(shared_row) {
                *out = r * factor + s;
            }
        }
    });

    output
}
