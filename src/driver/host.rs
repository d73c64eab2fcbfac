//! Host-memory reference driver.
//!
//! Kernels are Rust closures registered by name; `compute` mirrors a real
//! driver's behaviour against per-cruncher device copies: arguments with
//! the `read` flag are uploaded before the kernels run, kernels operate
//! only on the device copies, and arguments with the `write` flag are
//! downloaded afterwards. No-compute mode honours the transfer flags and
//! skips the kernels. One marker is counted per issued command.

use super::{CruncherOptions, Driver};
use crate::buffer::{ArgGroup, ArrayData};
use crate::cruncher::{ComputeSpec, Cruncher};
use crate::device::{AcceleratorMask, DeviceDescriptor};
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A host kernel: `(work_item_index, argument_views)`.
pub type HostKernel = Arc<dyn Fn(usize, &mut KernelIo<'_>) + Send + Sync>;

/// Argument views handed to a host kernel.
///
/// Arguments appear in the order they were bound (`inputs ++ hidden ++
/// outputs` for pipeline stages). Accessing an argument with the wrong
/// kind accessor is a programming error and panics, like an out-of-range
/// index would.
pub struct KernelIo<'a> {
    slots: &'a mut [ArrayData],
    map: &'a [usize],
}

macro_rules! io_accessors {
    ($get:ident, $set:ident, $variant:ident, $ty:ty) => {
        /// Read one element of an argument
        pub fn $get(&self, arg: usize, index: usize) -> $ty {
            match &self.slots[self.map[arg]] {
                ArrayData::$variant(v) => v[index],
                other => panic!(
                    "kernel argument {} is {:?}, not {}",
                    arg,
                    other.kind(),
                    stringify!($variant)
                ),
            }
        }

        /// Write one element of an argument
        pub fn $set(&mut self, arg: usize, index: usize, value: $ty) {
            match &mut self.slots[self.map[arg]] {
                ArrayData::$variant(v) => v[index] = value,
                other => panic!(
                    "kernel argument {} is {:?}, not {}",
                    arg,
                    other.kind(),
                    stringify!($variant)
                ),
            }
        }
    };
}

impl KernelIo<'_> {
    io_accessors!(f32, set_f32, F32, f32);
    io_accessors!(f64, set_f64, F64, f64);
    io_accessors!(u8, set_u8, U8, u8);
    io_accessors!(i8, set_i8, I8, i8);
    io_accessors!(i32, set_i32, I32, i32);
    io_accessors!(u32, set_u32, U32, u32);
    io_accessors!(i64, set_i64, I64, i64);

    /// Number of arguments
    pub fn arg_count(&self) -> usize {
        self.map.len()
    }

    /// Element count of an argument
    pub fn len(&self, arg: usize) -> usize {
        self.slots[self.map[arg]].len()
    }

    /// True if the argument holds no elements
    pub fn is_empty(&self, arg: usize) -> bool {
        self.len(arg) == 0
    }

    /// Raw bytes of a struct argument
    pub fn bytes(&self, arg: usize) -> &[u8] {
        match &self.slots[self.map[arg]] {
            ArrayData::Struct { bytes, .. } => bytes,
            other => panic!("kernel argument {} is {:?}, not Struct", arg, other.kind()),
        }
    }

    /// Mutable raw bytes of a struct argument
    pub fn bytes_mut(&mut self, arg: usize) -> &mut [u8] {
        match &mut self.slots[self.map[arg]] {
            ArrayData::Struct { bytes, .. } => bytes,
            other => panic!("kernel argument {} is {:?}, not Struct", arg, other.kind()),
        }
    }

    /// Byte stride of a struct argument
    pub fn stride(&self, arg: usize) -> usize {
        match &self.slots[self.map[arg]] {
            ArrayData::Struct { stride, .. } => *stride,
            other => panic!("kernel argument {} is {:?}, not Struct", arg, other.kind()),
        }
    }
}

impl std::fmt::Debug for KernelIo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelIo")
            .field("args", &self.map.len())
            .finish()
    }
}

/// Host driver: enumerates synthetic devices and interprets registered
/// closures as kernels.
pub struct HostDriver {
    kernels: Arc<RwLock<HashMap<String, HostKernel>>>,
    // cruncher construction contends on the driver, not on a global
    build_lock: Mutex<()>,
    cpu_devices: usize,
    gpu_devices: usize,
    acc_devices: usize,
}

impl HostDriver {
    /// Driver with one CPU device and one GPU device.
    pub fn new() -> Arc<Self> {
        Self::with_devices(1, 1, 0)
    }

    /// Driver with an explicit synthetic device census.
    pub fn with_devices(cpus: usize, gpus: usize, accs: usize) -> Arc<Self> {
        Arc::new(Self {
            kernels: Arc::new(RwLock::new(HashMap::new())),
            build_lock: Mutex::new(()),
            cpu_devices: cpus,
            gpu_devices: gpus,
            acc_devices: accs,
        })
    }

    /// Register (or replace) a kernel implementation by name.
    pub fn define_kernel<F>(&self, name: &str, f: F)
    where
        F: Fn(usize, &mut KernelIo<'_>) + Send + Sync + 'static,
    {
        self.kernels.write().insert(name.to_string(), Arc::new(f));
    }
}

impl std::fmt::Debug for HostDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDriver")
            .field("kernels", &self.kernels.read().len())
            .field("cpu_devices", &self.cpu_devices)
            .field("gpu_devices", &self.gpu_devices)
            .field("acc_devices", &self.acc_devices)
            .finish()
    }
}

impl Driver for HostDriver {
    fn enumerate(&self, mask: AcceleratorMask) -> Vec<DeviceDescriptor> {
        let mut out = Vec::new();
        let mut id = 0;
        let mut push = |count: usize, kind: AcceleratorMask, label: &str, out: &mut Vec<_>| {
            for i in 0..count {
                out.push(DeviceDescriptor {
                    id,
                    name: format!("host-{}-{}", label, i),
                    kind,
                    relative_speed: 1.0,
                });
                id += 1;
            }
        };
        if mask.contains(AcceleratorMask::CPU) {
            push(self.cpu_devices, AcceleratorMask::CPU, "cpu", &mut out);
        }
        if mask.contains(AcceleratorMask::GPU) {
            push(self.gpu_devices, AcceleratorMask::GPU, "gpu", &mut out);
        }
        if mask.contains(AcceleratorMask::ACC) {
            push(self.acc_devices, AcceleratorMask::ACC, "acc", &mut out);
        }
        out
    }

    fn build_cruncher(
        &self,
        devices: &[DeviceDescriptor],
        _source: &str,
        opts: &CruncherOptions,
    ) -> Result<Arc<dyn Cruncher>> {
        if devices.is_empty() {
            return Err(Error::driver("cannot build a cruncher for zero devices"));
        }
        let _build = self.build_lock.lock();
        Ok(Arc::new(HostCruncher {
            kernels: Arc::clone(&self.kernels),
            devices: devices.to_vec(),
            queue_concurrency: opts.queue_concurrency.clamp(1, 16),
            device_mem: Mutex::new(HashMap::new()),
            enqueue: AtomicBool::new(false),
            enqueue_async: AtomicBool::new(false),
            no_compute: AtomicBool::new(false),
            fine_grained: AtomicBool::new(false),
            smooth_balancer: AtomicBool::new(false),
            performance_feed: AtomicBool::new(false),
            markers: AtomicU64::new(0),
            marker_callbacks: AtomicU64::new(0),
            last_queue: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }))
    }
}

/// Dispatch engine of the host driver.
pub struct HostCruncher {
    kernels: Arc<RwLock<HashMap<String, HostKernel>>>,
    devices: Vec<DeviceDescriptor>,
    queue_concurrency: usize,
    device_mem: Mutex<HashMap<u64, ArrayData>>,
    enqueue: AtomicBool,
    enqueue_async: AtomicBool,
    no_compute: AtomicBool,
    fine_grained: AtomicBool,
    smooth_balancer: AtomicBool,
    performance_feed: AtomicBool,
    markers: AtomicU64,
    marker_callbacks: AtomicU64,
    last_queue: AtomicUsize,
    disposed: AtomicBool,
}

impl std::fmt::Debug for HostCruncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCruncher")
            .field("devices", &self.device_names())
            .field("markers", &self.count_markers())
            .finish()
    }
}

impl HostCruncher {
    fn retire_marker(&self) {
        self.markers.fetch_add(1, Ordering::Relaxed);
        self.marker_callbacks.fetch_add(1, Ordering::Relaxed);
    }
}

impl Cruncher for HostCruncher {
    fn compute(&self, args: &ArgGroup, spec: &ComputeSpec) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::scheduling("cruncher is disposed"));
        }

        // Map each argument to its unique backing array so aliased
        // arguments (transition pairs) share one device copy.
        let mut unique_ids: Vec<u64> = Vec::new();
        let mut map: Vec<usize> = Vec::with_capacity(args.len());
        for slot in args.slots() {
            let id = slot.handle.id();
            let idx = match unique_ids.iter().position(|u| *u == id) {
                Some(idx) => idx,
                None => {
                    unique_ids.push(id);
                    unique_ids.len() - 1
                }
            };
            map.push(idx);
        }

        // Upload phase: refresh device copies of read-flagged arguments,
        // materialise first-touch copies for the rest.
        let mut owned: Vec<ArrayData> = Vec::with_capacity(unique_ids.len());
        {
            let mut mem = self.device_mem.lock();
            for (uidx, id) in unique_ids.iter().enumerate() {
                let slot = args
                    .slots()
                    .iter()
                    .find(|s| s.handle.id() == *id)
                    .expect("unique id from args");
                let reads = args.slots().iter().any(|s| {
                    s.handle.id() == *id && (s.flags.read || s.flags.partial_read)
                });
                let data = if reads {
                    self.retire_marker();
                    slot.handle.snapshot()
                } else {
                    mem.remove(id).unwrap_or_else(|| slot.handle.snapshot())
                };
                debug_assert_eq!(uidx, owned.len());
                owned.push(data);
            }
        }

        // Kernel phase.
        if !self.no_compute.load(Ordering::Acquire) {
            let kernels = self.kernels.read();
            for name in spec.kernels.split_whitespace() {
                let f = kernels.get(name).ok_or_else(|| {
                    Error::driver(format!("kernel {:?} is not defined", name))
                })?;
                let mut io = KernelIo {
                    slots: &mut owned,
                    map: &map,
                };
                for gid in spec.offset..spec.offset + spec.global {
                    f(gid, &mut io);
                }
                self.retire_marker();
            }
            let queues = self.queue_concurrency.max(1);
            self.last_queue
                .store((self.last_queue.load(Ordering::Relaxed) + 1) % queues, Ordering::Relaxed);
        }

        // Download phase, then park the device copies again.
        {
            let mut mem = self.device_mem.lock();
            for (uidx, id) in unique_ids.iter().enumerate() {
                let writes = args
                    .slots()
                    .iter()
                    .any(|s| s.handle.id() == *id && s.flags.write);
                if writes {
                    let slot = args
                        .slots()
                        .iter()
                        .find(|s| s.handle.id() == *id)
                        .expect("unique id from args");
                    slot.handle.write().copy_from(&owned[uidx])?;
                    self.retire_marker();
                }
                mem.insert(*id, std::mem::replace(&mut owned[uidx], ArrayData::U8(Vec::new())));
            }
        }

        Ok(())
    }

    fn set_enqueue_mode(&self, on: bool) {
        self.enqueue.store(on, Ordering::Release);
    }

    fn enqueue_mode(&self) -> bool {
        self.enqueue.load(Ordering::Acquire)
    }

    fn set_enqueue_mode_async(&self, on: bool) {
        self.enqueue_async.store(on, Ordering::Release);
    }

    fn set_no_compute_mode(&self, on: bool) {
        self.no_compute.store(on, Ordering::Release);
    }

    fn no_compute_mode(&self) -> bool {
        self.no_compute.load(Ordering::Acquire)
    }

    fn set_fine_grained_queue_control(&self, on: bool) {
        self.fine_grained.store(on, Ordering::Release);
    }

    fn set_smooth_load_balancer(&self, on: bool) {
        self.smooth_balancer.store(on, Ordering::Release);
    }

    fn set_performance_feed(&self, on: bool) {
        self.performance_feed.store(on, Ordering::Release);
    }

    fn flush(&self) {
        // Synchronous driver: queued work has already completed.
    }

    fn count_markers(&self) -> u64 {
        self.markers.load(Ordering::Relaxed)
    }

    fn count_marker_callbacks(&self) -> u64 {
        self.marker_callbacks.load(Ordering::Relaxed)
    }

    fn device_names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name.clone()).collect()
    }

    fn last_used_queue_of_first_device(&self) -> usize {
        self.last_queue.load(Ordering::Relaxed)
    }

    fn throughputs(&self) -> Vec<f64> {
        self.devices.iter().map(|d| d.relative_speed).collect()
    }

    fn relative_global_ranges(&self, _compute_id: u32) -> Vec<f64> {
        let n = self.devices.len().max(1);
        vec![1.0 / n as f64; n]
    }

    fn error_code(&self) -> i32 {
        0
    }

    fn error_message(&self) -> String {
        String::new()
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.device_mem.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ArgFlags, ArrayHandle, ElementKind};
    use crate::cruncher::next_compute_id;

    fn scale_cruncher() -> (Arc<HostDriver>, Arc<dyn Cruncher>) {
        let driver = HostDriver::new();
        driver.define_kernel("scale2", |gid, io| {
            let v = io.f32(0, gid);
            io.set_f32(1, gid, v * 2.0);
        });
        let devices = driver.enumerate(AcceleratorMask::GPU);
        let cruncher = driver
            .build_cruncher(&devices, "kernel void scale2() {}", &CruncherOptions::default())
            .unwrap();
        (driver, cruncher)
    }

    #[test]
    fn test_read_compute_write() {
        let (_driver, cruncher) = scale_cruncher();
        let input = ArrayHandle::from_f32(vec![1.0, 2.0, 3.0, 4.0]);
        let output = ArrayHandle::zeroed(ElementKind::F32, 4);

        let mut args = ArgGroup::new();
        args.push(input, ArgFlags::input());
        args.push(output.clone(), ArgFlags::output());

        cruncher
            .compute(&args, &ComputeSpec::new(next_compute_id(), "scale2", 4, 1))
            .unwrap();

        match &*output.read() {
            ArrayData::F32(v) => assert_eq!(v, &vec![2.0, 4.0, 6.0, 8.0]),
            _ => panic!("wrong kind"),
        };
    }

    #[test]
    fn test_no_compute_honours_flags_only() {
        let (_driver, cruncher) = scale_cruncher();
        let input = ArrayHandle::from_f32(vec![5.0]);
        let output = ArrayHandle::zeroed(ElementKind::F32, 1);

        let mut args = ArgGroup::new();
        args.push(input, ArgFlags::input());
        args.push(output.clone(), ArgFlags::output());

        cruncher.set_no_compute_mode(true);
        cruncher
            .compute(&args, &ComputeSpec::new(next_compute_id(), "scale2", 1, 1))
            .unwrap();

        // Kernel skipped: the device copy of the output was never written.
        match &*output.read() {
            ArrayData::F32(v) => assert_eq!(v[0], 0.0),
            _ => panic!("wrong kind"),
        };
    }

    #[test]
    fn test_device_copy_persists() {
        let driver = HostDriver::new();
        driver.define_kernel("bump", |gid, io| {
            let v = io.f32(0, gid);
            io.set_f32(0, gid, v + 1.0);
        });
        let devices = driver.enumerate(AcceleratorMask::GPU);
        let cruncher = driver
            .build_cruncher(&devices, "", &CruncherOptions::default())
            .unwrap();

        let state = ArrayHandle::zeroed(ElementKind::F32, 1);
        // No read flag after first touch, no write flag until the end.
        let args = ArgGroup::single(state.clone(), ArgFlags::none());
        let spec = ComputeSpec::new(next_compute_id(), "bump", 1, 1);

        cruncher.compute(&args, &spec).unwrap();
        cruncher.compute(&args, &spec).unwrap();

        let drain = ArgGroup::single(state.clone(), ArgFlags::output());
        cruncher.set_no_compute_mode(true);
        cruncher.compute(&drain, &spec).unwrap();

        match &*state.read() {
            ArrayData::F32(v) => assert_eq!(v[0], 2.0),
            _ => panic!("wrong kind"),
        };
    }

    #[test]
    fn test_missing_kernel_is_an_error() {
        let (_driver, cruncher) = scale_cruncher();
        let args = ArgGroup::single(ArrayHandle::zeroed(ElementKind::F32, 1), ArgFlags::none());
        let result = cruncher.compute(&args, &ComputeSpec::new(next_compute_id(), "nope", 1, 1));
        assert!(result.is_err());
    }

    #[test]
    fn test_markers_count_commands() {
        let (_driver, cruncher) = scale_cruncher();
        let input = ArrayHandle::from_f32(vec![1.0]);
        let output = ArrayHandle::zeroed(ElementKind::F32, 1);

        let mut args = ArgGroup::new();
        args.push(input, ArgFlags::input());
        args.push(output, ArgFlags::output());

        let before = cruncher.count_markers();
        cruncher
            .compute(&args, &ComputeSpec::new(next_compute_id(), "scale2", 1, 1))
            .unwrap();
        // One upload, one kernel, one download.
        assert_eq!(cruncher.count_markers() - before, 3);
    }
}
