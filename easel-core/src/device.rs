use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use tracing::warn;

use crate::error::{GeneratorError, Result};

/// Select the device for a generator instance.
///
/// Policy, evaluated once at construction and never re-probed:
/// explicit CPU-only config wins, then CUDA, then Metal, then CPU.
pub fn select_device(cpu_only: bool) -> Result<Device> {
    if cpu_only {
        return Ok(Device::Cpu);
    }
    if cuda_is_available() {
        return Device::new_cuda(0).map_err(|e| GeneratorError::Device(e.to_string()));
    }
    if metal_is_available() {
        return Device::new_metal(0).map_err(|e| GeneratorError::Device(e.to_string()));
    }
    warn!("no accelerator available, falling back to CPU; generation will be slow");
    Ok(Device::Cpu)
}

/// Label used in results and diagnostics: "cuda", "mps" or "cpu".
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "mps",
    }
}

/// Flush pending device work and let the allocator reclaim freed buffers.
///
/// Called by `cleanup` after weights are dropped so memory is returned
/// eagerly rather than at the allocator's leisure.
pub fn reclaim_device_memory(device: &Device) {
    if let Err(e) = device.synchronize() {
        warn!("device synchronize during cleanup failed: {e}");
    }
}

/// Reset memory-tracking statistics before a measured run.
///
/// Deliberately a separate operation from generation; benchmark harnesses
/// call it between warmup and timed iterations.
pub fn reset_memory_stats(device: &Device) -> Result<()> {
    device.synchronize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_only_forces_cpu() {
        let device = select_device(true).unwrap();
        assert!(matches!(device, Device::Cpu));
        assert_eq!(device_name(&device), "cpu");
    }

    #[test]
    fn cleanup_helpers_are_noops_on_cpu() {
        let device = Device::Cpu;
        reclaim_device_memory(&device);
        reset_memory_stats(&device).unwrap();
    }
}
