//! Facade configuration.

use crate::device::AcceleratorMask;
use crate::error::{Error, Result};

/// Lowest accepted compute-queue concurrency.
pub const MIN_QUEUE_CONCURRENCY: usize = 1;
/// Highest accepted compute-queue concurrency.
pub const MAX_QUEUE_CONCURRENCY: usize = 16;

/// Options governing facade construction and device selection.
#[derive(Debug, Clone)]
pub struct FacadeConfig {
    /// Which accelerator kinds to select
    pub mask: AcceleratorMask,
    /// CPU sub-device count; negative selects all (driver fissions to cores minus one)
    pub cpu_fission_count: i32,
    /// GPU count; negative selects all
    pub gpu_count: i32,
    /// Request streaming (host-visible) buffers from the driver
    pub stream: bool,
    /// Disable the driver's own read-compute-write pipelining
    pub no_pipelining: bool,
    /// Number of asynchronous command queues per device, clamped to [1, 16]
    pub queue_concurrency: usize,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            mask: AcceleratorMask::ALL,
            cpu_fission_count: -1,
            gpu_count: -1,
            stream: true,
            no_pipelining: false,
            queue_concurrency: MAX_QUEUE_CONCURRENCY,
        }
    }
}

impl FacadeConfig {
    /// Start building a configuration
    pub fn builder() -> FacadeConfigBuilder {
        FacadeConfigBuilder::new()
    }

    /// Queue concurrency clamped into the accepted range
    pub fn effective_queue_concurrency(&self) -> usize {
        self.queue_concurrency
            .clamp(MIN_QUEUE_CONCURRENCY, MAX_QUEUE_CONCURRENCY)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mask.is_empty() {
            return Err(Error::config("accelerator mask must select at least one kind"));
        }
        if self.cpu_fission_count == 0 && self.gpu_count == 0 && self.mask == AcceleratorMask::ALL {
            return Err(Error::config("selection caps exclude every device"));
        }
        Ok(())
    }
}

/// Builder for [`FacadeConfig`].
#[derive(Debug, Default)]
pub struct FacadeConfigBuilder {
    config: FacadeConfig,
}

impl FacadeConfigBuilder {
    /// New builder with defaults
    pub fn new() -> Self {
        Self {
            config: FacadeConfig::default(),
        }
    }

    /// Select accelerator kinds
    pub fn mask(mut self, mask: AcceleratorMask) -> Self {
        self.config.mask = mask;
        self
    }

    /// Cap CPU sub-device count (negative selects all)
    pub fn cpu_fission_count(mut self, n: i32) -> Self {
        self.config.cpu_fission_count = n;
        self
    }

    /// Cap GPU count (negative selects all)
    pub fn gpu_count(mut self, n: i32) -> Self {
        self.config.gpu_count = n;
        self
    }

    /// Request streaming buffers
    pub fn stream(mut self, stream: bool) -> Self {
        self.config.stream = stream;
        self
    }

    /// Disable driver-side pipelining
    pub fn no_pipelining(mut self, no_pipelining: bool) -> Self {
        self.config.no_pipelining = no_pipelining;
        self
    }

    /// Set queue concurrency (clamped to [1, 16] when used)
    pub fn queue_concurrency(mut self, n: usize) -> Self {
        self.config.queue_concurrency = n;
        self
    }

    /// Validate and produce the configuration
    pub fn build(self) -> Result<FacadeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_concurrency_clamp() {
        let config = FacadeConfig {
            queue_concurrency: 64,
            ..FacadeConfig::default()
        };
        assert_eq!(config.effective_queue_concurrency(), 16);

        let config = FacadeConfig {
            queue_concurrency: 0,
            ..FacadeConfig::default()
        };
        assert_eq!(config.effective_queue_concurrency(), 1);
    }

    #[test]
    fn test_builder_produces_valid_config() {
        let config = FacadeConfig::builder()
            .mask(AcceleratorMask::CPU | AcceleratorMask::GPU)
            .cpu_fission_count(2)
            .queue_concurrency(8)
            .build()
            .unwrap();
        assert_eq!(config.cpu_fission_count, 2);
        assert_eq!(config.effective_queue_concurrency(), 8);
    }
}
