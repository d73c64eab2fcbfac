//! Pipeline stages: binding, dispatch, switching, forwarding.

use crate::buffer::{ArgFlags, ArgGroup, ArrayHandle, ElementKind, HostSlice, HostSliceMut, StageBuffer};
use crate::cruncher::{next_compute_id, ComputeSpec, CruncherFacade};
use crate::device::DeviceSet;
use crate::error::{Error, Result};
use crate::telemetry::Metrics;
use log::{error, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct KernelBinding {
    source: String,
    names: Vec<String>,
    globals: Vec<usize>,
    locals: Vec<usize>,
    init_names: Vec<String>,
    init_globals: Vec<usize>,
    init_locals: Vec<usize>,
}

pub(crate) struct StageShared {
    devices: Mutex<Option<DeviceSet>>,
    kernels: Mutex<KernelBinding>,
    pub(crate) inputs: RwLock<Vec<StageBuffer>>,
    hidden: RwLock<Vec<StageBuffer>>,
    pub(crate) outputs: RwLock<Vec<StageBuffer>>,
    pub(crate) prev: Mutex<Option<Arc<StageShared>>>,
    pub(crate) next: Mutex<Vec<Weak<StageShared>>>,
    pub(crate) stage_order: AtomicUsize,
    facade: Mutex<Option<Arc<CruncherFacade>>>,
    init_complete: AtomicBool,
    enqueue_mode: AtomicBool,
    stop_host_device_transmission: AtomicBool,
    disabled: AtomicBool,
    init_kernels_disabled: AtomicBool,
    compute_id: u32,
    last_run: Mutex<Duration>,
    pub(crate) metrics: Mutex<Option<Arc<Metrics>>>,
}

impl StageShared {
    fn order(&self) -> usize {
        self.stage_order.load(Ordering::Relaxed)
    }

    /// First-run validation and lazy cruncher construction.
    fn prepare(&self) -> Result<()> {
        {
            let binding = self.kernels.lock();
            if binding.names.is_empty() {
                return Err(Error::binding("no kernels bound"));
            }
            for (i, name) in binding.names.iter().enumerate() {
                if binding.names[..i].contains(name) {
                    return Err(Error::binding(format!("kernel {:?} bound twice", name)));
                }
            }
            if binding.globals.len() != binding.names.len()
                || binding.locals.len() != binding.names.len()
            {
                return Err(Error::binding(format!(
                    "{} kernels but {} global / {} local ranges",
                    binding.names.len(),
                    binding.globals.len(),
                    binding.locals.len()
                )));
            }
            if !binding.init_names.is_empty()
                && (binding.init_globals.len() != binding.init_names.len()
                    || binding.init_locals.len() != binding.init_names.len())
            {
                warn!(
                    "stage {}: initializer ranges do not match names, initializers disabled",
                    self.order()
                );
                self.init_kernels_disabled.store(true, Ordering::Release);
            }
        }

        let devices = self
            .devices
            .lock()
            .clone()
            .ok_or_else(|| Error::binding("no devices bound"))?;
        let source = self.kernels.lock().source.clone();

        // Device pipelining stays off: stage overlap comes from the
        // pipeline's own double buffering.
        let facade = CruncherFacade::from_devices(devices, &source, true, 16)?;
        facade.set_enqueue_mode(self.enqueue_mode.load(Ordering::Relaxed));
        *self.facade.lock() = Some(Arc::new(facade));

        for buf in self.inputs.write().iter_mut() {
            buf.set_flags(ArgFlags::input());
        }
        for buf in self.outputs.write().iter_mut() {
            buf.set_flags(ArgFlags::output());
        }
        for buf in self.hidden.write().iter_mut() {
            buf.set_flags(ArgFlags::none());
        }

        self.init_complete.store(true, Ordering::Release);
        Ok(())
    }

    fn arg_group(&self) -> (ArgGroup, usize, usize, usize) {
        let inputs = self.inputs.read();
        let hidden = self.hidden.read();
        let outputs = self.outputs.read();

        let mut args = ArgGroup::new();
        for buf in inputs.iter() {
            args.push(buf.primary().clone(), buf.flags());
        }
        for buf in hidden.iter() {
            args.push(buf.primary().clone(), buf.flags());
        }
        for buf in outputs.iter() {
            args.push(buf.primary().clone(), buf.flags());
        }
        (args, inputs.len(), hidden.len(), outputs.len())
    }

    /// Issue this stage's kernels against the primary buffer sides.
    pub(crate) fn run(&self, init_mode: bool) {
        if self.disabled.load(Ordering::Acquire) {
            return;
        }
        if !self.init_complete.load(Ordering::Acquire) {
            if let Err(e) = self.prepare() {
                error!("stage {}: {}", self.order(), e);
                self.disabled.store(true, Ordering::Release);
                return;
            }
        }

        let facade = match self.facade.lock().clone() {
            Some(f) => f,
            None => return,
        };

        let (names, globals, locals) = {
            let binding = self.kernels.lock();
            if init_mode {
                if binding.init_names.is_empty()
                    || self.init_kernels_disabled.load(Ordering::Acquire)
                {
                    return;
                }
                (
                    binding.init_names.clone(),
                    binding.init_globals.clone(),
                    binding.init_locals.clone(),
                )
            } else {
                (
                    binding.names.clone(),
                    binding.globals.clone(),
                    binding.locals.clone(),
                )
            }
        };

        let (mut args, n_in, n_hidden, n_out) = self.arg_group();
        let enqueue = self.enqueue_mode.load(Ordering::Relaxed);
        let silent = self.stop_host_device_transmission.load(Ordering::Relaxed);
        let n_kernels = names.len();
        let started = Instant::now();

        for (i, name) in names.iter().enumerate() {
            if silent {
                args.clear_flags();
            } else if enqueue {
                // One device read of the inputs before the first kernel,
                // one device write of the outputs after the last.
                for j in 0..n_in {
                    args.set_flags(
                        j,
                        ArgFlags {
                            read: i == 0,
                            write: false,
                            partial_read: false,
                        },
                    );
                }
                for j in n_in..n_in + n_hidden {
                    args.set_flags(j, ArgFlags::none());
                }
                for j in n_in + n_hidden..n_in + n_hidden + n_out {
                    args.set_flags(
                        j,
                        ArgFlags {
                            read: false,
                            write: i == n_kernels - 1,
                            partial_read: false,
                        },
                    );
                }
            }

            let spec = ComputeSpec::new(self.compute_id, name.clone(), globals[i], locals[i]);
            if let Err(e) = facade.compute(&args, &spec) {
                error!("stage {} kernel {:?}: {}", self.order(), name, e);
                break;
            }
        }

        let elapsed = started.elapsed();
        *self.last_run.lock() = elapsed;
        if let Some(metrics) = self.metrics.lock().as_ref() {
            metrics.record_stage_run(elapsed.as_nanos() as u64);
        }
    }

    pub(crate) fn switch_input_buffers(&self) {
        for buf in self.inputs.write().iter_mut() {
            buf.switch_buffers();
        }
    }

    pub(crate) fn switch_output_buffers(&self) {
        for buf in self.outputs.write().iter_mut() {
            buf.switch_buffers();
        }
    }

    pub(crate) fn switch_all_buffers(&self) {
        self.switch_input_buffers();
        for buf in self.hidden.write().iter_mut() {
            buf.switch_buffers();
        }
        self.switch_output_buffers();
    }

    fn copy_error(&self, what: &str) {
        error!("stage {}: {}", self.order(), what);
        if let Some(metrics) = self.metrics.lock().as_ref() {
            metrics.record_copy_error();
        }
    }

    /// Shuttle the passive buffer sides across the chain boundaries.
    ///
    /// All copies source and target the duplicate sides, so they never
    /// race the concurrent `run` of any stage. A validation failure logs
    /// and abandons the remaining copies of that boundary.
    pub(crate) fn forward_results(
        &self,
        index: usize,
        max_index: usize,
        host_inputs: Option<&[HostSlice<'_>]>,
        mut host_outputs: Option<&mut [HostSliceMut<'_>]>,
    ) {
        if index == 0 {
            if let Some(ins) = host_inputs {
                let inputs = self.inputs.read();
                for (i, hs) in ins.iter().enumerate() {
                    let Some(buf) = inputs.get(i) else {
                        self.copy_error(&format!("host input {} has no stage buffer", i));
                        return;
                    };
                    let Some(dup) = buf.switched_buffer() else {
                        self.copy_error(&format!("input {} is not duplicated", i));
                        return;
                    };
                    if hs.kind() != buf.kind() {
                        self.copy_error(&format!(
                            "host input {}: kind {:?} does not match {:?}",
                            i,
                            hs.kind(),
                            buf.kind()
                        ));
                        return;
                    }
                    if hs.len() != dup.len() {
                        self.copy_error(&format!(
                            "host input {}: length {} does not match {}",
                            i,
                            hs.len(),
                            dup.len()
                        ));
                        return;
                    }
                    if let Err(e) = hs.copy_into(dup) {
                        self.copy_error(&format!("host input {}: {}", i, e));
                        return;
                    }
                }
            }
        }

        if index == max_index {
            if let Some(outs) = host_outputs.as_deref_mut() {
                let outputs = self.outputs.read();
                for (i, hs) in outs.iter_mut().enumerate() {
                    let Some(buf) = outputs.get(i) else {
                        self.copy_error(&format!("host output {} has no stage buffer", i));
                        return;
                    };
                    let Some(dup) = buf.switched_buffer() else {
                        self.copy_error(&format!("output {} is not duplicated", i));
                        return;
                    };
                    if hs.kind() != buf.kind() {
                        self.copy_error(&format!(
                            "host output {}: kind {:?} does not match {:?}",
                            i,
                            hs.kind(),
                            buf.kind()
                        ));
                        return;
                    }
                    if hs.len() != dup.len() {
                        self.copy_error(&format!(
                            "host output {}: length {} does not match {}",
                            i,
                            hs.len(),
                            dup.len()
                        ));
                        return;
                    }
                    if let Err(e) = hs.copy_from(dup) {
                        self.copy_error(&format!("host output {}: {}", i, e));
                        return;
                    }
                }
            }
        }

        let nexts: Vec<Arc<StageShared>> = self
            .next
            .lock()
            .iter()
            .filter_map(|w| w.upgrade())
            .collect();
        if nexts.is_empty() {
            return;
        }

        let outputs = self.outputs.read();
        for next in nexts {
            let next_inputs = next.inputs.read();
            for (i, out_buf) in outputs.iter().enumerate() {
                if out_buf.kind() == ElementKind::Struct {
                    self.copy_error(&format!(
                        "output {}: struct arrays cannot be forwarded across stage edges",
                        i
                    ));
                    return;
                }
                let Some(src) = out_buf.switched_buffer() else {
                    self.copy_error(&format!("output {} is not duplicated", i));
                    return;
                };
                let Some(dst_buf) = next_inputs.get(i) else {
                    self.copy_error(&format!(
                        "output {} has no matching input on stage {}",
                        i,
                        next.order()
                    ));
                    return;
                };
                let Some(dst) = dst_buf.switched_buffer() else {
                    self.copy_error(&format!(
                        "input {} of stage {} is not duplicated",
                        i,
                        next.order()
                    ));
                    return;
                };
                if out_buf.kind() != dst_buf.kind() {
                    self.copy_error(&format!(
                        "edge {} -> {}: kind {:?} does not match {:?}",
                        self.order(),
                        next.order(),
                        out_buf.kind(),
                        dst_buf.kind()
                    ));
                    return;
                }
                if src.len() != dst.len() {
                    self.copy_error(&format!(
                        "edge {} -> {}: length {} does not match {}",
                        self.order(),
                        next.order(),
                        src.len(),
                        dst.len()
                    ));
                    return;
                }
                if let Err(e) = dst.copy_from_handle(src) {
                    self.copy_error(&format!("edge {} -> {}: {}", self.order(), next.order(), e));
                    return;
                }
            }
        }
    }
}

/// One stage of a multi-stage pipeline.
///
/// Cheap to clone; clones refer to the same stage.
#[derive(Clone)]
pub struct PipelineStage {
    pub(crate) shared: Arc<StageShared>,
}

impl PipelineStage {
    /// Fresh unbound stage with enqueue mode on.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(StageShared {
                devices: Mutex::new(None),
                kernels: Mutex::new(KernelBinding::default()),
                inputs: RwLock::new(Vec::new()),
                hidden: RwLock::new(Vec::new()),
                outputs: RwLock::new(Vec::new()),
                prev: Mutex::new(None),
                next: Mutex::new(Vec::new()),
                stage_order: AtomicUsize::new(0),
                facade: Mutex::new(None),
                init_complete: AtomicBool::new(false),
                enqueue_mode: AtomicBool::new(true),
                stop_host_device_transmission: AtomicBool::new(false),
                disabled: AtomicBool::new(false),
                init_kernels_disabled: AtomicBool::new(false),
                compute_id: next_compute_id(),
                last_run: Mutex::new(Duration::ZERO),
                metrics: Mutex::new(None),
            }),
        }
    }

    /// Bind the device set that runs this stage.
    pub fn add_devices(&self, devices: DeviceSet) -> &Self {
        *self.shared.devices.lock() = Some(devices);
        self
    }

    /// Bind kernel source and the ordered kernels with their ranges.
    ///
    /// Later calls append bindings; the last source wins. Validation is
    /// deferred until the first run.
    pub fn add_kernels(
        &self,
        source: &str,
        names: &[&str],
        globals: &[usize],
        locals: &[usize],
    ) -> &Self {
        let mut binding = self.shared.kernels.lock();
        binding.source = source.to_string();
        binding.names.extend(names.iter().map(|s| s.to_string()));
        binding.globals.extend_from_slice(globals);
        binding.locals.extend_from_slice(locals);
        self
    }

    /// Bind kernels run only while the pipeline is built.
    pub fn initializer_kernel(&self, names: &[&str], globals: &[usize], locals: &[usize]) -> &Self {
        let mut binding = self.shared.kernels.lock();
        binding.init_names.extend(names.iter().map(|s| s.to_string()));
        binding.init_globals.extend_from_slice(globals);
        binding.init_locals.extend_from_slice(locals);
        self
    }

    /// Bind input arrays (duplicated).
    pub fn add_input_buffers(&self, arrays: &[ArrayHandle]) -> &Self {
        let mut inputs = self.shared.inputs.write();
        for a in arrays {
            inputs.push(StageBuffer::new(a.clone(), true));
        }
        self
    }

    /// Bind output arrays (duplicated).
    pub fn add_output_buffers(&self, arrays: &[ArrayHandle]) -> &Self {
        let mut outputs = self.shared.outputs.write();
        for a in arrays {
            outputs.push(StageBuffer::new(a.clone(), true));
        }
        self
    }

    /// Bind hidden state arrays (device resident, not duplicated).
    pub fn add_hidden_buffers(&self, arrays: &[ArrayHandle]) -> &Self {
        let mut hidden = self.shared.hidden.write();
        for a in arrays {
            hidden.push(StageBuffer::new(a.clone(), false));
        }
        self
    }

    /// Link this stage before `other`.
    pub fn prepend_to_stage(&self, other: &PipelineStage) -> &Self {
        self.shared
            .next
            .lock()
            .push(Arc::downgrade(&other.shared));
        *other.shared.prev.lock() = Some(Arc::clone(&self.shared));
        self
    }

    /// Link this stage after `other`.
    pub fn append_to_stage(&self, other: &PipelineStage) -> &Self {
        other
            .shared
            .next
            .lock()
            .push(Arc::downgrade(&self.shared));
        *self.shared.prev.lock() = Some(Arc::clone(&other.shared));
        self
    }

    /// Fuse kernels under one enveloping transfer pair (default on).
    pub fn set_enqueue_mode(&self, on: bool) -> &Self {
        self.shared.enqueue_mode.store(on, Ordering::Relaxed);
        self
    }

    /// Keep this stage's buffers device resident across runs.
    pub fn set_stop_host_device_transmission(&self, on: bool) -> &Self {
        self.shared
            .stop_host_device_transmission
            .store(on, Ordering::Relaxed);
        self
    }

    /// Position of this stage in its linearised chain.
    pub fn stage_order(&self) -> usize {
        self.shared.order()
    }

    /// Wall-clock duration of the last run (debug).
    pub fn last_run_duration(&self) -> Duration {
        *self.shared.last_run.lock()
    }

    /// True once a binding error took the stage out of service.
    pub fn disabled(&self) -> bool {
        self.shared.disabled.load(Ordering::Acquire)
    }
}

impl Default for PipelineStage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStage")
            .field("stage_order", &self.shared.order())
            .field("inputs", &self.shared.inputs.read().len())
            .field("hidden", &self.shared.hidden.read().len())
            .field("outputs", &self.shared.outputs.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ElementKind;
    use crate::device::AcceleratorMask;
    use crate::driver::HostDriver;

    fn identity_stage(driver: &Arc<HostDriver>, len: usize) -> PipelineStage {
        driver.define_kernel("ident", |gid, io| {
            let v = io.f32(0, gid);
            io.set_f32(1, gid, v);
        });
        let devices = DeviceSet::all(driver.clone(), AcceleratorMask::GPU).unwrap();
        let stage = PipelineStage::new();
        stage
            .add_devices(devices)
            .add_kernels("kernel void ident() {}", &["ident"], &[len], &[1])
            .add_input_buffers(&[ArrayHandle::zeroed(ElementKind::F32, len)])
            .add_output_buffers(&[ArrayHandle::zeroed(ElementKind::F32, len)]);
        stage
    }

    #[test]
    fn test_run_computes_on_primaries() {
        let driver = HostDriver::new();
        let stage = identity_stage(&driver, 4);

        {
            let inputs = stage.shared.inputs.read();
            HostSlice::F32(&[1.0, 2.0, 3.0, 4.0])
                .copy_into(inputs[0].primary())
                .unwrap();
        }

        stage.shared.run(false);
        assert!(!stage.disabled());

        let outputs = stage.shared.outputs.read();
        match &*outputs[0].primary().read() {
            crate::buffer::ArrayData::F32(v) => assert_eq!(v, &vec![1.0, 2.0, 3.0, 4.0]),
            _ => panic!("wrong kind"),
        };
    }

    #[test]
    fn test_range_mismatch_disables_stage() {
        let driver = HostDriver::new();
        driver.define_kernel("ident", |_gid, _io| {});
        let devices = DeviceSet::all(driver, AcceleratorMask::GPU).unwrap();
        let stage = PipelineStage::new();
        stage
            .add_devices(devices)
            .add_kernels("kernel void ident() {}", &["ident"], &[4, 8], &[1])
            .add_input_buffers(&[ArrayHandle::zeroed(ElementKind::F32, 4)])
            .add_output_buffers(&[ArrayHandle::zeroed(ElementKind::F32, 4)]);

        stage.shared.run(false);
        assert!(stage.disabled());
    }

    #[test]
    fn test_forward_copies_duplicates() {
        let driver = HostDriver::new();
        let first = identity_stage(&driver, 2);
        let second = identity_stage(&driver, 2);
        first.prepend_to_stage(&second);

        {
            let outputs = first.shared.outputs.read();
            HostSlice::F32(&[7.0, 8.0])
                .copy_into(outputs[0].switched_buffer().unwrap())
                .unwrap();
        }

        first.shared.forward_results(0, 1, None, None);

        let inputs = second.shared.inputs.read();
        match &*inputs[0].switched_buffer().unwrap().read() {
            crate::buffer::ArrayData::F32(v) => assert_eq!(v, &vec![7.0, 8.0]),
            _ => panic!("wrong kind"),
        };
        // The producing primary stays untouched by the forward phase.
        match &*first.shared.outputs.read()[0].primary().read() {
            crate::buffer::ArrayData::F32(v) => assert_eq!(v, &vec![0.0, 0.0]),
            _ => panic!("wrong kind"),
        };
    }

    #[test]
    fn test_forward_length_mismatch_aborts() {
        let driver = HostDriver::new();
        let first = identity_stage(&driver, 2);
        let second = identity_stage(&driver, 4);
        first.prepend_to_stage(&second);

        first.shared.forward_results(0, 1, None, None);

        // Nothing copied into the mismatching input.
        let inputs = second.shared.inputs.read();
        match &*inputs[0].switched_buffer().unwrap().read() {
            crate::buffer::ArrayData::F32(v) => assert!(v.iter().all(|x| *x == 0.0)),
            _ => panic!("wrong kind"),
        };
    }
}
