//! CUDA kernel wrappers for the fused MoE elementwise ops.
//!
//! The PTX is compiled from `kernels/mul_add.cu` by the build script when
//! the `cuda-kernels` feature is enabled (requires nvcc, see `build.rs`).
//! Kernels are launched through candle's cudarc re-export with one thread
//! block per grid-stride worker: block `w` covers rows
//! `w, w + gridDim.x, w + 2*gridDim.x, ...`.

use candle_core::cuda::CudaStorageSlice;
use candle_core::{CudaDevice, CudaStorage, Layout, Result, Shape};

const MUL_ADD_PTX: &str = include_str!("../kernels/mul_add.ptx");

/// Widest thread block the kernels are launched with.
const MAX_BLOCK_THREADS: usize = 1024;

/// Streaming multiprocessor count of `dev`, the CUDA analogue of the CPU
/// worker-pool width.
pub fn multiprocessor_count(dev: &CudaDevice) -> Result<usize> {
    use candle_core::cuda::cudarc::driver::sys::CUdevice_attribute;

    let count = dev
        .cuda_stream()
        .context()
        .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
        .map_err(|e| candle_core::Error::Msg(format!("multiprocessor count query: {e}")))?;
    Ok((count as usize).max(1))
}

/// Launch the fused `routed * factor + shared` kernel.
///
/// Grid: `min(batch_size, multiprocessor count)` blocks, one grid-stride
/// worker each. Block: next power of two >= `hidden_size`, capped at the
/// hardware block limit; threads past `hidden_size` idle out on the column
/// guard, so non-power-of-two widths never touch memory past the row end.
pub(crate) fn mul_add_cuda(
    factor: f64,
    routed: &CudaStorage,
    routed_layout: &Layout,
    shared: &CudaStorage,
    shared_layout: &Layout,
) -> Result<(CudaStorage, Shape)> {
    use candle_core::cuda::cudarc::driver::{LaunchConfig, PushKernelArg};
    use half::{bf16, f16};

    let dev = &routed.device;
    let (batch_size, hidden_size) = routed_layout.shape().dims2()?;

    if routed_layout.start_offset() != 0 || !routed_layout.is_contiguous() {
        candle_core::bail!("mul_add: routed input must be contiguous from offset 0");
    }
    if shared_layout.start_offset() != 0 || !shared_layout.is_contiguous() {
        candle_core::bail!("mul_add: shared input must be contiguous from offset 0");
    }

    let n_rows = batch_size.min(multiprocessor_count(dev)?).max(1);
    let block_threads = hidden_size.next_power_of_two().clamp(32, MAX_BLOCK_THREADS);
    let cfg = LaunchConfig {
        grid_dim: (n_rows as u32, 1, 1),
        block_dim: (block_threads as u32, 1, 1),
        shared_mem_bytes: 0,
    };

    let elem_count = batch_size * hidden_size;
    let batch_i32 = batch_size as i32;
    let hidden_i32 = hidden_size as i32;
    let factor_f32 = factor as f32;

    let output = match (&routed.slice, &shared.slice) {
        (CudaStorageSlice::F32(routed), CudaStorageSlice::F32(shared)) => {
            let out = dev.alloc_zeros::<f32>(elem_count)?;
            let func = dev.get_or_load_custom_func("mul_add_f32_kernel", "mul_add", MUL_ADD_PTX)?;
            let mut builder = func.builder();
            builder.arg(&out);
            builder.arg(routed);
            builder.arg(shared);
            builder.arg(&factor_f32);
            builder.arg(&batch_i32);
            builder.arg(&hidden_i32);
            unsafe { builder.launch(cfg) }
                .map_err(|e| candle_core::Error::Msg(format!("mul_add launch: {e}")))?;
            CudaStorageSlice::F32(out)
        }
        (CudaStorageSlice::F16(routed), CudaStorageSlice::F16(shared)) => {
            let out = dev.alloc_zeros::<f16>(elem_count)?;
            let func = dev.get_or_load_custom_func("mul_add_f16_kernel", "mul_add", MUL_ADD_PTX)?;
            let mut builder = func.builder();
            builder.arg(&out);
            builder.arg(routed);
            builder.arg(shared);
            builder.arg(&factor_f32);
            builder.arg(&batch_i32);
            builder.arg(&hidden_i32);
            unsafe { builder.launch(cfg) }
                .map_err(|e| candle_core::Error::Msg(format!("mul_add launch: {e}")))?;
            CudaStorageSlice::F16(out)
        }
        (CudaStorageSlice::BF16(routed), CudaStorageSlice::BF16(shared)) => {
            let out = dev.alloc_zeros::<bf16>(elem_count)?;
            let func =
                dev.get_or_load_custom_func("mul_add_bf16_kernel", "mul_add", MUL_ADD_PTX)?;
            let mut builder = func.builder();
            builder.arg(&out);
            builder.arg(routed);
            builder.arg(shared);
            builder.arg(&factor_f32);
            builder.arg(&batch_i32);
            builder.arg(&hidden_i32);
            unsafe { builder.launch(cfg) }
                .map_err(|e| candle_core::Error::Msg(format!("mul_add launch: {e}")))?;
            CudaStorageSlice::BF16(out)
        }
        _ => candle_core::bail!("mul_add CUDA kernel expects matching f32, f16 or bf16 inputs"),
    };

    let output = CudaStorage {
        slice: output,
        device: dev.clone(),
    };
    Ok((output, Shape::from_dims(&[batch_size, hidden_size])))
}
