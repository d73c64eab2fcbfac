//! Thin wrapper over an external cruncher.

use super::{ComputeSpec, Cruncher};
use crate::buffer::ArgGroup;
use crate::config::FacadeConfig;
use crate::device::{AcceleratorMask, DeviceSet};
use crate::driver::{CruncherOptions, Driver};
use crate::error::{Error, Result};
use log::{debug, error};
use parking_lot::Mutex;
use regex::Regex;
use std::sync::Arc;

/// Extract the ordered, de-duplicated kernel names from a source string.
pub fn extract_kernel_names(source: &str) -> Vec<String> {
    // The driver grammar declares kernels as `kernel void <name>(...)`.
    let re = Regex::new(r"kernel\s+void\s+([A-Za-z0-9_]+)").expect("kernel name pattern");
    let mut names = Vec::new();
    for cap in re.captures_iter(source) {
        let name = cap[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// True if the source requests a device-side default queue.
pub fn wants_device_side_queue(source: &str) -> bool {
    source.contains("enqueue_kernel(")
}

/// Facade over a [`Cruncher`]: kernel-name discovery, the compile-error
/// gate, and mode/marker pass-throughs.
///
/// After any dispatch error the facade records the failure and declines
/// further work for its cruncher.
pub struct CruncherFacade {
    cruncher: Arc<dyn Cruncher>,
    devices: DeviceSet,
    kernel_names: Vec<String>,
    failure: Mutex<Option<String>>,
}

impl CruncherFacade {
    /// Build a facade by selecting devices from `driver` with a kind mask.
    pub fn from_mask(
        driver: Arc<dyn Driver>,
        source: &str,
        config: &FacadeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let devices = DeviceSet::select(
            driver,
            config.mask,
            config.cpu_fission_count,
            config.gpu_count,
        )?;
        Self::build(
            devices,
            source,
            config.no_pipelining,
            config.effective_queue_concurrency(),
            config.stream,
        )
    }

    /// Build a facade over an explicit device set.
    pub fn from_devices(
        devices: DeviceSet,
        source: &str,
        no_pipelining: bool,
        queue_concurrency: usize,
    ) -> Result<Self> {
        Self::build(devices, source, no_pipelining, queue_concurrency, true)
    }

    fn build(
        devices: DeviceSet,
        source: &str,
        no_pipelining: bool,
        queue_concurrency: usize,
        stream: bool,
    ) -> Result<Self> {
        let kernel_names = extract_kernel_names(source);
        if kernel_names.is_empty() {
            return Err(Error::binding("no kernel names found in source"));
        }

        let opts = CruncherOptions {
            no_pipelining,
            queue_concurrency: queue_concurrency.clamp(1, 16),
            device_side_queue: wants_device_side_queue(source),
            stream,
        };

        let cruncher = devices
            .driver()
            .build_cruncher(devices.devices(), source, &opts)?;

        let code = cruncher.error_code();
        if code != 0 {
            let message = cruncher.error_message();
            cruncher.dispose();
            error!("cruncher build failed ({}): {}", code, message);
            return Err(Error::Compile { code, message });
        }

        debug!(
            "cruncher ready on {:?} with kernels {:?}",
            devices.names(),
            kernel_names
        );

        Ok(Self {
            cruncher,
            devices,
            kernel_names,
            failure: Mutex::new(None),
        })
    }

    /// Ordered kernel names discovered in the source
    pub fn kernel_names(&self) -> &[String] {
        &self.kernel_names
    }

    /// The device set this facade dispatches to
    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// Convenience mask query: true if any selected device is a GPU
    pub fn has_gpu(&self) -> bool {
        self.devices
            .devices()
            .iter()
            .any(|d| d.kind == AcceleratorMask::GPU)
    }

    /// True once a dispatch error put the facade out of service
    pub fn declined(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// The recorded failure, if any
    pub fn failure_message(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Dispatch `spec` against `args`.
    ///
    /// A facade that has recorded a failure declines with a scheduling
    /// error and performs nothing.
    pub fn compute(&self, args: &ArgGroup, spec: &ComputeSpec) -> Result<()> {
        if let Some(msg) = self.failure.lock().as_ref() {
            return Err(Error::scheduling(format!(
                "facade declined after failure: {}",
                msg
            )));
        }
        match self.cruncher.compute(args, spec) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("compute {:?} failed: {}", spec.kernels, e);
                *self.failure.lock() = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// See [`Cruncher::set_enqueue_mode`]
    pub fn set_enqueue_mode(&self, on: bool) {
        self.cruncher.set_enqueue_mode(on);
    }

    /// Current enqueue-mode state
    pub fn enqueue_mode(&self) -> bool {
        self.cruncher.enqueue_mode()
    }

    /// See [`Cruncher::set_enqueue_mode_async`]
    pub fn set_enqueue_mode_async(&self, on: bool) {
        self.cruncher.set_enqueue_mode_async(on);
    }

    /// See [`Cruncher::set_no_compute_mode`]
    pub fn set_no_compute_mode(&self, on: bool) {
        self.cruncher.set_no_compute_mode(on);
    }

    /// See [`Cruncher::set_fine_grained_queue_control`]
    pub fn set_fine_grained_queue_control(&self, on: bool) {
        self.cruncher.set_fine_grained_queue_control(on);
    }

    /// See [`Cruncher::set_smooth_load_balancer`]
    pub fn set_smooth_load_balancer(&self, on: bool) {
        self.cruncher.set_smooth_load_balancer(on);
    }

    /// See [`Cruncher::set_performance_feed`]
    pub fn set_performance_feed(&self, on: bool) {
        self.cruncher.set_performance_feed(on);
    }

    /// Flush queued commands
    pub fn flush(&self) {
        self.cruncher.flush();
    }

    /// Markers retired across all queues
    pub fn count_markers(&self) -> u64 {
        self.cruncher.count_markers()
    }

    /// Marker callbacks fired
    pub fn count_marker_callbacks(&self) -> u64 {
        self.cruncher.count_marker_callbacks()
    }

    /// Driver-reported device names
    pub fn device_names(&self) -> Vec<String> {
        self.cruncher.device_names()
    }

    /// Queue index the first device used last
    pub fn last_used_queue_of_first_device(&self) -> usize {
        self.cruncher.last_used_queue_of_first_device()
    }

    /// Relative throughput per device
    pub fn throughputs(&self) -> Vec<f64> {
        self.cruncher.throughputs()
    }

    /// Relative global-range share per device for `compute_id`
    pub fn relative_global_ranges(&self, compute_id: u32) -> Vec<f64> {
        self.cruncher.relative_global_ranges(compute_id)
    }

    /// Release the underlying cruncher
    pub fn dispose(&self) {
        self.cruncher.dispose();
    }
}

impl std::fmt::Debug for CruncherFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CruncherFacade")
            .field("devices", &self.devices)
            .field("kernel_names", &self.kernel_names)
            .field("declined", &self.declined())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_kernel_names() {
        let source = r#"
            kernel void scaleAll(global float* a, global float* b) { }
            kernel   void
            sumReduce(global float* a) { }
            void helper(float x) { }
        "#;
        let names = extract_kernel_names(source);
        assert_eq!(names, vec!["scaleAll".to_string(), "sumReduce".to_string()]);
    }

    #[test]
    fn test_duplicate_names_collapse() {
        let source = "kernel void tick() {} kernel void tick() {}";
        assert_eq!(extract_kernel_names(source).len(), 1);
    }

    #[test]
    fn test_no_names() {
        assert!(extract_kernel_names("void helper() {}").is_empty());
    }

    #[test]
    fn test_device_side_queue_detection() {
        assert!(wants_device_side_queue(
            "kernel void parent() { enqueue_kernel(q, flags, range, ^{ }); }"
        ));
        assert!(!wants_device_side_queue("kernel void parent() { }"));
    }
}
