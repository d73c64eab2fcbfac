use std::sync::Arc;
use strata::prelude::*;

const DT: f32 = 0.01;
const STIFFNESS: f32 = 0.5;

fn single_gpu(driver: &Arc<HostDriver>) -> DeviceSet {
    DeviceSet::all(driver.clone(), AcceleratorMask::GPU)
        .unwrap()
        .single(0)
        .unwrap()
}

const NBODY_SOURCE: &str = r#"
    kernel void springForces(global float* pos, global float* force) {}
    kernel void integrateVelocity(global float* force, global float* vel) {}
    kernel void integratePositions(global float* vel, global float* pos, global float* out) {}
"#;

fn define_nbody_kernels(driver: &HostDriver) {
    // force = -k * x
    driver.define_kernel("springForces", |gid, io| {
        let x = io.f32(0, gid);
        io.set_f32(1, gid, -STIFFNESS * x);
    });
    // v += f * dt
    driver.define_kernel("integrateVelocity", |gid, io| {
        let f = io.f32(0, gid);
        let v = io.f32(1, gid) + f * DT;
        io.set_f32(1, gid, v);
    });
    // x += v * dt; out = x
    driver.define_kernel("integratePositions", |gid, io| {
        let v = io.f32(0, gid);
        let x = io.f32(1, gid) + v * DT;
        io.set_f32(1, gid, x);
        io.set_f32(2, gid, x);
    });
}

/// Host reference of one spring tick, mirroring the kernel arithmetic.
fn reference_tick(pos: &mut [f32], vel: &mut [f32]) {
    for i in 0..pos.len() {
        let f = -STIFFNESS * pos[i];
        vel[i] += f * DT;
        pos[i] += vel[i] * DT;
    }
}

#[test]
fn serial_mode_matches_host_reference() {
    let driver = HostDriver::new();
    define_nbody_kernels(&driver);

    let initial = vec![1.0f32, -0.5, 0.25, 2.0];
    let positions = ArrayHandle::from_f32(initial.clone());
    let forces = ArrayHandle::zeroed(ElementKind::F32, 4);
    let velocities = ArrayHandle::zeroed(ElementKind::F32, 4);
    let readout = ArrayHandle::zeroed(ElementKind::F32, 4);

    let mut pipeline = DevicePipeline::new(single_gpu(&driver), NBODY_SOURCE, 4).unwrap();
    pipeline.enable_serial_mode();
    pipeline
        .add_stage(
            DeviceStage::new()
                .add_kernels(&["springForces"], &[4], &[1])
                .add_transition_array(positions.clone())
                .add_transition_array(forces.clone()),
        )
        .add_stage(
            DeviceStage::new()
                .add_kernels(&["integrateVelocity"], &[4], &[1])
                .add_transition_array(forces.clone())
                .add_transition_array(velocities.clone()),
        )
        .add_stage(
            DeviceStage::new()
                .add_kernels(&["integratePositions"], &[4], &[1])
                .add_transition_array(velocities)
                .add_transition_array(positions)
                .add_output_array(readout),
        );

    let mut ref_pos = initial;
    let mut ref_vel = vec![0.0f32; 4];
    let mut device_pos = [0.0f32; 4];

    for _ in 0..50 {
        pipeline
            .feed(None, Some(&mut [HostSliceMut::F32(&mut device_pos)]))
            .unwrap();
        reference_tick(&mut ref_pos, &mut ref_vel);
    }

    for (device, host) in device_pos.iter().zip(ref_pos.iter()) {
        assert!(
            (device - host).abs() < 1e-6,
            "device {} vs host {}",
            device,
            host
        );
    }
}

const CHAIN_SOURCE: &str = r#"
    kernel void doubleIt(global float* a, global float* t) {}
    kernel void addOne(global float* t, global float* b) {}
"#;

#[test]
fn parallel_mode_streams_with_stage_latency() {
    let driver = HostDriver::new();
    driver.define_kernel("doubleIt", |gid, io| {
        let v = io.f32(0, gid);
        io.set_f32(1, gid, v * 2.0);
    });
    driver.define_kernel("addOne", |gid, io| {
        let v = io.f32(0, gid);
        io.set_f32(1, gid, v + 1.0);
    });

    let transit = ArrayHandle::zeroed(ElementKind::F32, 1);
    let mut pipeline = DevicePipeline::new(single_gpu(&driver), CHAIN_SOURCE, 8).unwrap();
    pipeline
        .add_stage(
            DeviceStage::new()
                .add_kernels(&["doubleIt"], &[1], &[1])
                .add_input_array(ArrayHandle::zeroed(ElementKind::F32, 1))
                .add_transition_array(transit.clone()),
        )
        .add_stage(
            DeviceStage::new()
                .add_kernels(&["addOne"], &[1], &[1])
                .add_transition_array(transit)
                .add_output_array(ArrayHandle::zeroed(ElementKind::F32, 1)),
        );

    let mut observed = Vec::new();
    for t in 1..=10u32 {
        let input = [t as f32];
        let mut output = [0.0f32];
        pipeline
            .feed(
                Some(&[HostSlice::F32(&input)]),
                Some(&mut [HostSliceMut::F32(&mut output)]),
            )
            .unwrap();
        observed.push(output[0]);
    }

    // A two-stage software pipeline surfaces the input fed at feed t at
    // feed t + 3.
    for feed in 4..=10usize {
        let fed = (feed - 3) as f32;
        assert_eq!(observed[feed - 1], 2.0 * fed + 1.0, "feed {}", feed);
    }
}

#[test]
fn feed_async_overlaps_host_work() {
    let driver = HostDriver::new();
    driver.define_kernel("copyThrough", |gid, io| {
        let v = io.f32(0, gid);
        io.set_f32(1, gid, v);
    });

    let source = "kernel void copyThrough(global float* a, global float* b) {}";
    let mut pipeline = DevicePipeline::new(single_gpu(&driver), source, 2).unwrap();
    pipeline.add_stage(
        DeviceStage::new()
            .add_kernels(&["copyThrough"], &[4], &[1])
            .add_input_array(ArrayHandle::zeroed(ElementKind::F32, 4))
            .add_output_array(ArrayHandle::zeroed(ElementKind::F32, 4)),
    );

    let input = [3.0f32; 4];
    let mut output = [0.0f32; 4];
    let mut callback_ran = false;

    pipeline
        .feed_async(
            Some(&[HostSlice::F32(&input)]),
            Some(&mut [HostSliceMut::F32(&mut output)]),
            || {
                callback_ran = true;
            },
        )
        .unwrap();

    assert!(callback_ran);
    assert_eq!(pipeline.feed_counter(), 1);
}

#[test]
fn begin_end_split_feed() {
    let driver = HostDriver::new();
    driver.define_kernel("copyThrough", |gid, io| {
        let v = io.f32(0, gid);
        io.set_f32(1, gid, v);
    });

    let source = "kernel void copyThrough(global float* a, global float* b) {}";
    let mut pipeline = DevicePipeline::new(single_gpu(&driver), source, 2).unwrap();
    pipeline.add_stage(
        DeviceStage::new()
            .add_kernels(&["copyThrough"], &[2], &[1])
            .add_input_array(ArrayHandle::zeroed(ElementKind::F32, 2))
            .add_output_array(ArrayHandle::zeroed(ElementKind::F32, 2)),
    );

    let mut outputs = Vec::new();
    for t in 1..=6u32 {
        let input = [t as f32, t as f32];
        let mut output = [0.0f32; 2];
        pipeline
            .feed_async_begin(Some(&[HostSlice::F32(&input)]))
            .unwrap();
        pipeline
            .feed_async_end(Some(&mut [HostSliceMut::F32(&mut output)]))
            .unwrap();
        outputs.push(output[0]);
    }

    // One-stage parallel pipeline: input fed at feed t emerges at t + 2.
    for feed in 3..=6usize {
        assert_eq!(outputs[feed - 1], (feed - 2) as f32, "feed {}", feed);
    }
}

#[test]
fn overlap_report_not_available() {
    let driver = HostDriver::new();
    driver.define_kernel("noop", |_gid, _io| {});
    let source = "kernel void noop() {}";
    let pipeline = DevicePipeline::new(single_gpu(&driver), source, 1).unwrap();

    match pipeline.queue_overlap_report() {
        Err(Error::Capability(_)) => {}
        other => panic!("expected capability error, got {:?}", other),
    }
}

#[test]
fn queue_concurrency_is_clamped() {
    let driver = HostDriver::new();
    driver.define_kernel("noop", |_gid, _io| {});
    let source = "kernel void noop() {}";
    // 64 clamps to 16, 0 clamps to 1; both must construct.
    assert!(DevicePipeline::new(single_gpu(&driver), source, 64).is_ok());
    assert!(DevicePipeline::new(single_gpu(&driver), source, 0).is_ok());
}
