//! The linear pipeline and its push cycle.

use super::stage::{PipelineStage, StageShared};
use crate::buffer::{HostSlice, HostSliceMut};
use crate::error::{Error, Result};
use crate::executor::{scope, WorkPool};
use crate::telemetry::Metrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A linearised chain of stages advancing in lock step.
pub struct Pipeline {
    stages: Vec<Arc<StageShared>>,
    pool: WorkPool,
    counter: AtomicU64,
    metrics: Arc<Metrics>,
}

impl PipelineStage {
    /// Linearise the chain this stage belongs to and build the pipeline.
    ///
    /// Walks back-pointers to the root, orders the stages (at a fan-out
    /// node the chain follows the shortest branch; other branches remain
    /// broadcast copy targets), then initialises every buffer twice: the
    /// initializer kernels run once per buffer side with a switch in
    /// between, so both sides start identical.
    pub fn make_pipeline(&self) -> Result<Pipeline> {
        let mut visited: Vec<*const StageShared> = Vec::new();

        let mut root = Arc::clone(&self.shared);
        loop {
            let ptr = Arc::as_ptr(&root);
            if visited.contains(&ptr) {
                return Err(Error::binding("stage chain contains a cycle"));
            }
            visited.push(ptr);
            let prev = root.prev.lock().clone();
            match prev {
                Some(p) => root = p,
                None => break,
            }
        }

        visited.clear();
        let mut stages: Vec<Arc<StageShared>> = Vec::new();
        let mut cursor = Some(root);
        while let Some(node) = cursor {
            let ptr = Arc::as_ptr(&node);
            if visited.contains(&ptr) {
                return Err(Error::binding("stage chain contains a cycle"));
            }
            visited.push(ptr);

            let nexts: Vec<Arc<StageShared>> = node
                .next
                .lock()
                .iter()
                .filter_map(|w| w.upgrade())
                .collect();
            stages.push(node);

            cursor = nexts.into_iter().min_by_key(forward_depth);
        }

        let metrics = Arc::new(Metrics::new());
        for (order, stage) in stages.iter().enumerate() {
            stage.stage_order.store(order, Ordering::Relaxed);
            *stage.metrics.lock() = Some(Arc::clone(&metrics));
        }

        let pool = WorkPool::for_items(2 * stages.len())?;

        // Initialise every buffer twice so the duplicate sides match the
        // primaries.
        for stage in &stages {
            stage.run(true);
        }
        for stage in &stages {
            stage.switch_all_buffers();
        }
        for stage in &stages {
            stage.run(true);
        }
        for stage in &stages {
            stage.switch_all_buffers();
        }

        Ok(Pipeline {
            stages,
            pool,
            counter: AtomicU64::new(0),
            metrics,
        })
    }
}

fn forward_depth(node: &Arc<StageShared>) -> usize {
    let nexts: Vec<Arc<StageShared>> = node
        .next
        .lock()
        .iter()
        .filter_map(|w| w.upgrade())
        .collect();
    1 + nexts.iter().map(forward_depth).min().unwrap_or(0)
}

impl Pipeline {
    /// Advance every stage by one tick.
    ///
    /// Phase one runs all stage kernels and all forwarding copies
    /// concurrently; phase two switches the buffer pairs. Stage 0 keeps
    /// its input sides when no host input arrived this push; the exit
    /// stage keeps its output sides when the host is not draining.
    ///
    /// Returns `true` once the exit stage holds a valid result: with `N`
    /// stages the threshold is `2N - 2` pushes, plus one when the host
    /// feeds, plus one when the host drains.
    pub fn push(
        &self,
        host_inputs: Option<&[HostSlice<'_>]>,
        host_outputs: Option<&mut [HostSliceMut<'_>]>,
    ) -> bool {
        let n = self.stages.len();
        if n == 0 {
            return false;
        }
        let max_index = n - 1;
        let has_inputs = host_inputs.is_some();
        let has_outputs = host_outputs.is_some();

        scope(&self.pool, |s| {
            for stage in &self.stages {
                let stage = Arc::clone(stage);
                s.spawn(move || stage.run(false));
            }

            let mut outputs_slot = host_outputs;
            for (i, stage) in self.stages.iter().enumerate() {
                let stage = Arc::clone(stage);
                let ins = if i == 0 { host_inputs } else { None };
                let outs = if i == max_index {
                    outputs_slot.take()
                } else {
                    None
                };
                s.spawn(move || stage.forward_results(i, max_index, ins, outs));
            }
        });

        scope(&self.pool, |s| {
            for (i, stage) in self.stages.iter().enumerate() {
                let stage = Arc::clone(stage);
                let switch_inputs = i != 0 || has_inputs;
                let switch_outputs = i != max_index || has_outputs;
                s.spawn(move || {
                    if switch_inputs {
                        stage.switch_input_buffers();
                    }
                    if switch_outputs {
                        stage.switch_output_buffers();
                    }
                });
            }
        });

        let count = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let n = n as u64;
        let threshold = match (has_inputs, has_outputs) {
            (false, false) => 2 * n - 2,
            (true, false) | (false, true) => 2 * n - 1,
            (true, true) => 2 * n,
        };
        count > threshold
    }

    /// Number of stages in the chain
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Number of pushes so far
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Shared metrics collector
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .field("counter", &self.counter())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ArrayHandle, ElementKind};
    use crate::device::{AcceleratorMask, DeviceSet};
    use crate::driver::HostDriver;

    fn chain(driver: &Arc<HostDriver>, stages: usize, len: usize) -> Pipeline {
        driver.define_kernel("ident", |gid, io| {
            let v = io.f32(0, gid);
            io.set_f32(1, gid, v);
        });

        let mut built: Vec<PipelineStage> = Vec::new();
        for _ in 0..stages {
            let devices = DeviceSet::all(driver.clone(), AcceleratorMask::GPU).unwrap();
            let stage = PipelineStage::new();
            stage
                .add_devices(devices)
                .add_kernels("kernel void ident() {}", &["ident"], &[len], &[1])
                .add_input_buffers(&[ArrayHandle::zeroed(ElementKind::F32, len)])
                .add_output_buffers(&[ArrayHandle::zeroed(ElementKind::F32, len)]);
            if let Some(last) = built.last() {
                stage.append_to_stage(last);
            }
            built.push(stage);
        }

        built[0].make_pipeline().unwrap()
    }

    #[test]
    fn test_stage_order_assigned() {
        let driver = HostDriver::new();
        let pipeline = chain(&driver, 3, 2);
        assert_eq!(pipeline.stage_count(), 3);
    }

    #[test]
    fn test_make_pipeline_from_any_stage() {
        let driver = HostDriver::new();
        driver.define_kernel("ident", |gid, io| {
            let v = io.f32(0, gid);
            io.set_f32(1, gid, v);
        });

        let a = PipelineStage::new();
        let b = PipelineStage::new();
        for stage in [&a, &b] {
            let devices = DeviceSet::all(driver.clone(), AcceleratorMask::GPU).unwrap();
            stage
                .add_devices(devices)
                .add_kernels("kernel void ident() {}", &["ident"], &[2], &[1])
                .add_input_buffers(&[ArrayHandle::zeroed(ElementKind::F32, 2)])
                .add_output_buffers(&[ArrayHandle::zeroed(ElementKind::F32, 2)]);
        }
        a.prepend_to_stage(&b);

        // Built from the tail, the chain still roots at `a`.
        let pipeline = b.make_pipeline().unwrap();
        assert_eq!(pipeline.stage_count(), 2);
        assert_eq!(a.stage_order(), 0);
        assert_eq!(b.stage_order(), 1);
    }

    #[test]
    fn test_readiness_thresholds() {
        let driver = HostDriver::new();
        let pipeline = chain(&driver, 2, 2);

        let input = [1.0f32, 2.0];
        let mut output = [0.0f32; 2];

        // Both ends live: ready strictly after 2N pushes.
        for push in 1..=5u64 {
            let ready = pipeline.push(
                Some(&[HostSlice::F32(&input)]),
                Some(&mut [HostSliceMut::F32(&mut output)]),
            );
            assert_eq!(ready, push > 4, "push {}", push);
        }
    }
}
