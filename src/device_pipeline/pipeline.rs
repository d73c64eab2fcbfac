//! The single-device pipeline driver.

use super::stage::{BufferRole, DeviceStage};
use crate::buffer::{HostSlice, HostSliceMut, StageBuffer};
use crate::cruncher::{ComputeSpec, CruncherFacade};
use crate::device::DeviceSet;
use crate::error::{Error, Result};
use crate::executor::{scope, WorkPool};
use log::error;

/// N stages on one device, overlapping transfer and compute through the
/// cruncher's asynchronous queues and double-buffered I/O.
///
/// Two dispatch modes:
///
/// * **Serial**: one `feed` traverses the whole chain synchronously on
///   the parity-selected buffer side; the result of the fed input is
///   available in the same call.
/// * **Parallel** (default): stages are software pipelined: the first
///   feed pre-swaps even-indexed stages so adjacent stages compute on
///   opposite sides of their shared transition pairs. An identity chain
///   of `N` stages returns the input fed at feed `t` at feed `t + N + 1`.
pub struct DevicePipeline {
    facade: CruncherFacade,
    stages: Vec<DeviceStage>,
    serial: bool,
    io_switch_counter: u64,
    parallel_primed: bool,
    pool: WorkPool,
}

impl DevicePipeline {
    /// Build a pipeline on exactly one device with up to 16 command
    /// queues.
    pub fn new(device: DeviceSet, source: &str, queue_concurrency: usize) -> Result<Self> {
        if device.len() != 1 {
            return Err(Error::binding(format!(
                "device pipeline needs exactly one device, got {}",
                device.len()
            )));
        }
        let facade =
            CruncherFacade::from_devices(device, source, true, queue_concurrency.clamp(1, 16))?;
        let pool = WorkPool::for_items(4)?;
        Ok(Self {
            facade,
            stages: Vec::new(),
            serial: false,
            io_switch_counter: 0,
            parallel_primed: false,
            pool,
        })
    }

    /// Append a stage, pairing its transition arrays with the previous
    /// stage.
    pub fn add_stage(&mut self, mut stage: DeviceStage) -> &mut Self {
        for slot in &mut stage.slots {
            if slot.role != BufferRole::Transition {
                continue;
            }
            let adopted = self.stages.last().and_then(|prev| {
                prev.find_matching(slot.buffer.primary())
                    .map(|prev_buf: &StageBuffer| {
                        StageBuffer::shared_pair(
                            prev_buf.primary().clone(),
                            prev_buf.switched_buffer().cloned(),
                        )
                    })
            });
            match adopted {
                Some(buffer) => slot.buffer = buffer,
                // First side of a pair: allocate the shadow here.
                None => slot.buffer.set_duplicated(true),
            }
        }
        self.stages.push(stage);
        self
    }

    /// Process stages one after another within each feed.
    pub fn enable_serial_mode(&mut self) -> &mut Self {
        self.serial = true;
        self
    }

    /// Software pipeline the stages (default).
    pub fn enable_parallel_mode(&mut self) -> &mut Self {
        self.serial = false;
        self
    }

    /// Number of stages
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// The facade dispatching to the device
    pub fn facade(&self) -> &CruncherFacade {
        &self.facade
    }

    /// Number of feeds so far
    pub fn feed_counter(&self) -> u64 {
        self.io_switch_counter
    }

    /// Queue timeline overlap measurements.
    pub fn queue_overlap_report(&self) -> Result<String> {
        Err(Error::capability(
            "queue timeline overlap reporting is not available on this driver",
        ))
    }

    /// One tick: feed host inputs, advance every stage, drain host
    /// outputs.
    pub fn feed<'a>(
        &mut self,
        inputs: Option<&'a [HostSlice<'a>]>,
        outputs: Option<&'a mut [HostSliceMut<'a>]>,
    ) -> Result<()> {
        self.feed_async_begin(inputs)?;
        self.feed_async_end(outputs)
    }

    /// One tick with a host callback overlapping the device work.
    pub fn feed_async<'a, F>(
        &mut self,
        inputs: Option<&'a [HostSlice<'a>]>,
        outputs: Option<&'a mut [HostSliceMut<'a>]>,
        host_callback: F,
    ) -> Result<()>
    where
        F: FnOnce() + Send,
    {
        if self.stages.is_empty() {
            return Err(Error::binding("device pipeline has no stages"));
        }
        if self.serial {
            // Serial traversal leaves nothing to overlap with besides
            // the callback itself.
            self.run_serial_chain(inputs)?;
            host_callback();
            self.drain_serial(outputs)?;
            self.io_switch_counter += 1;
            return Ok(());
        }

        self.dispatch_overlapped()?;
        let copy_result = scope(&self.pool, |s| {
            s.spawn(host_callback);
            self.queue_host_copies(s, inputs, outputs)
        });
        copy_result?;
        self.finish_overlapped_feed();
        Ok(())
    }

    /// Issue the device work of one tick.
    pub fn feed_async_begin<'a>(&mut self, inputs: Option<&'a [HostSlice<'a>]>) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::binding("device pipeline has no stages"));
        }
        if self.serial {
            self.run_serial_chain(inputs)
        } else {
            self.dispatch_overlapped()?;
            scope(&self.pool, |s| self.queue_host_copies(s, inputs, None))
        }
    }

    /// Synchronise and drain the host outputs of one tick.
    pub fn feed_async_end<'a>(&mut self, outputs: Option<&'a mut [HostSliceMut<'a>]>) -> Result<()> {
        if self.serial {
            self.drain_serial(outputs)?;
            self.io_switch_counter += 1;
            Ok(())
        } else {
            self.facade.flush();
            scope(&self.pool, |s| self.queue_host_copies(s, None, outputs))?;
            self.finish_overlapped_feed();
            Ok(())
        }
    }

    fn parity_odd(&self) -> bool {
        self.io_switch_counter % 2 == 1
    }

    // ---- serial mode -----------------------------------------------

    fn run_serial_chain(&mut self, inputs: Option<&[HostSlice<'_>]>) -> Result<()> {
        let odd = self.parity_odd();

        if let Some(ins) = inputs {
            let entrance = &self.stages[0];
            copy_host_inputs(entrance, odd, ins)?;
        }

        self.facade.set_enqueue_mode(true);
        let result = self.run_serial_stages(odd);
        self.facade.set_enqueue_mode(false);
        self.facade.flush();
        result
    }

    fn run_serial_stages(&self, odd: bool) -> Result<()> {
        for stage in &self.stages {
            let uploads = stage.input_transfer_args(odd);
            if !uploads.is_empty() {
                self.facade.set_no_compute_mode(true);
                let spec = transfer_spec(stage);
                let r = self.facade.compute(&uploads, &spec);
                self.facade.set_no_compute_mode(false);
                r?;
            }

            let args = stage.kernel_args(odd);
            for (i, name) in stage.names.iter().enumerate() {
                let spec = ComputeSpec::new(
                    stage.compute_id,
                    name.clone(),
                    stage.globals[i],
                    stage.locals[i],
                );
                self.facade.compute(&args, &spec)?;
            }

            let downloads = stage.output_transfer_args(odd);
            if !downloads.is_empty() {
                self.facade.set_no_compute_mode(true);
                let spec = transfer_spec(stage);
                let r = self.facade.compute(&downloads, &spec);
                self.facade.set_no_compute_mode(false);
                r?;
            }
        }
        Ok(())
    }

    fn drain_serial(&mut self, outputs: Option<&mut [HostSliceMut<'_>]>) -> Result<()> {
        let odd = self.parity_odd();
        if let Some(outs) = outputs {
            let exit = self
                .stages
                .last()
                .ok_or_else(|| Error::binding("device pipeline has no stages"))?;
            copy_host_outputs(exit, odd, outs)?;
        }
        Ok(())
    }

    // ---- parallel mode ---------------------------------------------

    fn dispatch_overlapped(&mut self) -> Result<()> {
        if !self.parallel_primed {
            // Alternate the parity of adjacent stages so each one
            // computes on the side its successor is not reading.
            for (i, stage) in self.stages.iter_mut().enumerate() {
                if i % 2 == 0 {
                    stage.switch_all();
                }
            }
            self.parallel_primed = true;
        }

        for stage in &self.stages {
            self.facade.set_enqueue_mode_async(true);

            let transfers = stage.overlap_transfer_args();
            if !transfers.is_empty() {
                self.facade.set_no_compute_mode(true);
                let spec = transfer_spec(stage);
                let r = self.facade.compute(&transfers, &spec);
                self.facade.flush();
                self.facade.set_no_compute_mode(false);
                r?;
            }

            let args = stage.kernel_args(false);
            for (i, name) in stage.names.iter().enumerate() {
                let spec = ComputeSpec::new(
                    stage.compute_id,
                    name.clone(),
                    stage.globals[i],
                    stage.locals[i],
                );
                self.facade.compute(&args, &spec)?;
            }
            self.facade.flush();
            self.facade.set_enqueue_mode_async(false);
        }
        Ok(())
    }

    fn queue_host_copies<'pool, 'scope, 'a: 'scope>(
        &'scope self,
        s: &mut crate::executor::Scope<'pool, 'scope>,
        inputs: Option<&'scope [HostSlice<'a>]>,
        outputs: Option<&'scope mut [HostSliceMut<'a>]>,
    ) -> Result<()> {
        if let Some(ins) = inputs {
            let entrance = self
                .stages
                .first()
                .ok_or_else(|| Error::binding("device pipeline has no stages"))?;
            s.spawn(move || {
                // Parallel-mode host copies target the shuttle side.
                if let Err(e) = copy_host_inputs(entrance, true, ins) {
                    error!("device pipeline host input copy: {}", e);
                }
            });
        }
        if let Some(outs) = outputs {
            let exit = self
                .stages
                .last()
                .ok_or_else(|| Error::binding("device pipeline has no stages"))?;
            s.spawn(move || {
                if let Err(e) = copy_host_outputs(exit, true, outs) {
                    error!("device pipeline host output copy: {}", e);
                }
            });
        }
        Ok(())
    }

    fn finish_overlapped_feed(&mut self) {
        for stage in &mut self.stages {
            stage.switch_all();
        }
        self.io_switch_counter += 1;
    }
}

impl std::fmt::Debug for DevicePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePipeline")
            .field("stages", &self.stages.len())
            .field("serial", &self.serial)
            .field("feeds", &self.io_switch_counter)
            .finish()
    }
}

fn transfer_spec(stage: &DeviceStage) -> ComputeSpec {
    ComputeSpec::new(
        stage.compute_id,
        stage.names.join(" "),
        stage.globals.first().copied().unwrap_or(1),
        stage.locals.first().copied().unwrap_or(1),
    )
}

fn validate_copy(
    what: &str,
    index: usize,
    expected: (crate::buffer::ElementKind, usize),
    found: (crate::buffer::ElementKind, usize),
) -> Result<()> {
    if expected.0 != found.0 {
        return Err(Error::binding(format!(
            "{} {}: kind {:?} does not match {:?}",
            what, index, found.0, expected.0
        )));
    }
    if expected.1 != found.1 {
        return Err(Error::binding(format!(
            "{} {}: length {} does not match {}",
            what, index, found.1, expected.1
        )));
    }
    Ok(())
}

fn copy_host_inputs(stage: &DeviceStage, odd: bool, ins: &[HostSlice<'_>]) -> Result<()> {
    let mut slot_iter = stage
        .slots
        .iter()
        .filter(|s| s.role == BufferRole::Input);
    for (i, hs) in ins.iter().enumerate() {
        let slot = slot_iter
            .next()
            .ok_or_else(|| Error::binding(format!("host input {} has no stage array", i)))?;
        let side = DeviceStage::side(&slot.buffer, odd);
        validate_copy(
            "host input",
            i,
            (slot.buffer.kind(), side.len()),
            (hs.kind(), hs.len()),
        )?;
        hs.copy_into(&side)?;
    }
    Ok(())
}

fn copy_host_outputs(stage: &DeviceStage, odd: bool, outs: &mut [HostSliceMut<'_>]) -> Result<()> {
    let mut slot_iter = stage
        .slots
        .iter()
        .filter(|s| s.role == BufferRole::Output);
    for (i, hs) in outs.iter_mut().enumerate() {
        let slot = slot_iter
            .next()
            .ok_or_else(|| Error::binding(format!("host output {} has no stage array", i)))?;
        let side = DeviceStage::side(&slot.buffer, odd);
        validate_copy(
            "host output",
            i,
            (slot.buffer.kind(), side.len()),
            (hs.kind(), hs.len()),
        )?;
        hs.copy_from(&side)?;
    }
    Ok(())
}

