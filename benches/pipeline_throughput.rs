//! Push throughput of a three-stage identity pipeline on the host driver.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strata::prelude::*;

fn build_pipeline(len: usize) -> Pipeline {
    let driver = HostDriver::new();
    driver.define_kernel("ident", |gid, io| {
        let v = io.f32(0, gid);
        io.set_f32(1, gid, v);
    });

    let mut stages: Vec<PipelineStage> = Vec::new();
    for _ in 0..3 {
        let devices = DeviceSet::all(driver.clone(), AcceleratorMask::GPU).unwrap();
        let stage = PipelineStage::new();
        stage
            .add_devices(devices)
            .add_kernels("kernel void ident() {}", &["ident"], &[len], &[1])
            .add_input_buffers(&[ArrayHandle::zeroed(ElementKind::F32, len)])
            .add_output_buffers(&[ArrayHandle::zeroed(ElementKind::F32, len)]);
        if let Some(last) = stages.last() {
            stage.append_to_stage(last);
        }
        stages.push(stage);
    }

    stages[0].make_pipeline().unwrap()
}

fn bench_push(c: &mut Criterion) {
    let pipeline = build_pipeline(1024);
    let input = vec![1.0f32; 1024];
    let mut output = vec![0.0f32; 1024];

    c.bench_function("pipeline_push_1k", |b| {
        b.iter(|| {
            let ready = pipeline.push(
                Some(&[HostSlice::F32(black_box(&input))]),
                Some(&mut [HostSliceMut::F32(&mut output)]),
            );
            black_box(ready)
        })
    });
}

fn bench_push_no_host(c: &mut Criterion) {
    let pipeline = build_pipeline(1024);

    c.bench_function("pipeline_push_device_only", |b| {
        b.iter(|| black_box(pipeline.push(None, None)))
    });
}

criterion_group!(benches, bench_push, bench_push_no_host);
criterion_main!(benches);
