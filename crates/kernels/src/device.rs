//! Device parallelism queries.
//!
//! Kernel launchers size their grid as `min(batch_size, parallel_units)`:
//! enough workers to cover the batch, never more than the device can run
//! concurrently. The grid-stride loop inside each kernel handles the case
//! where the batch is larger than the worker count.

use candle_core::Device;

/// Number of independent parallel compute units on `device`.
///
/// - CPU: width of the rayon worker pool.
/// - CUDA (with the `cuda-kernels` feature): streaming multiprocessor count.
/// - Other devices: 1 — work is not partitioned on the composite fallback
///   path, so a single logical unit is reported.
pub fn parallel_units(device: &Device) -> usize {
    match device {
        Device::Cpu => rayon::current_num_threads().max(1),
        #[cfg(feature = "cuda-kernels")]
        Device::Cuda(dev) => crate::cuda_kernels::multiprocessor_count(dev).unwrap_or(1),
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_reports_at_least_one_unit() {
        assert!(parallel_units(&Device::Cpu) >= 1);
    }
}
