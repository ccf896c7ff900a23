//! Process-wide execution context.
//!
//! The compute device is acquired once, handed by reference to every
//! constructor and training call, and released when the context is dropped.

use candle_core::{DType, Device};

use crate::config::DeviceSettings;
use crate::error::LeelazResult;

/// Compute device and element type shared by the network and the trainer.
#[derive(Debug)]
pub struct ExecutionContext {
    device: Device,
    dtype: DType,
}

impl ExecutionContext {
    /// Acquire the configured device.
    ///
    /// CUDA is used only when the `cuda` feature is enabled and the device is
    /// available; otherwise the context falls back to the CPU with a warning.
    /// `LEELAZ_FORCE_CPU=1` and `LEELAZ_CUDA_DEVICE=<n>` override the settings.
    ///
    /// # Errors
    ///
    /// Returns an error only if device initialization fails hard.
    pub fn acquire(settings: &DeviceSettings) -> LeelazResult<Self> {
        let force_cpu = settings.force_cpu
            || std::env::var("LEELAZ_FORCE_CPU")
                .ok()
                .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        let ordinal = std::env::var("LEELAZ_CUDA_DEVICE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(settings.cuda_device);

        let device = if !force_cpu && cfg!(feature = "cuda") {
            match Device::cuda_if_available(ordinal) {
                Ok(device @ Device::Cuda(_)) => {
                    tracing::info!("Training device: CUDA (device {})", ordinal);
                    device
                }
                Ok(_) => {
                    tracing::warn!("CUDA not available; falling back to CPU");
                    Device::Cpu
                }
                Err(err) => {
                    tracing::warn!("CUDA init failed ({err}); falling back to CPU");
                    Device::Cpu
                }
            }
        } else {
            if force_cpu {
                tracing::info!("CPU mode forced");
            }
            Device::Cpu
        };

        Ok(Self {
            device,
            dtype: DType::F32,
        })
    }

    /// CPU context, used by tests and tools.
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }

    /// Get device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Element type of every parameter and activation
    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        tracing::debug!("Releasing execution context on {:?}", self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forced_cpu() {
        let settings = DeviceSettings {
            force_cpu: true,
            cuda_device: 0,
        };
        let ctx = ExecutionContext::acquire(&settings).unwrap();
        assert!(ctx.device().is_cpu());
        assert_eq!(ctx.dtype(), DType::F32);
    }
}
