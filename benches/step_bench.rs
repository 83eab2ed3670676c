use archipelago::*;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

fn build_world(body_count: usize) -> Registry {
    let mut registry = Registry::new();
    let mut config = SimulationConfig::default();
    config.settings.paused = true;
    config.num_worker_threads = 2;
    attach(&mut registry, config);

    make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .kind(BodyKind::Static)
            .shape(Shape::Plane {
                normal: Vec3::Y,
                constant: 0.0,
            }),
    );

    let side = (body_count as f32).sqrt().ceil() as usize;
    for i in 0..body_count {
        let x = (i % side) as f32 * 1.5;
        let z = (i / side) as f32 * 1.5;
        make_rigidbody(
            &mut registry,
            RigidBodyDef::new()
                .position(Vec3::new(x, 0.6, z))
                .shape(Shape::Box {
                    half_extents: Vec3::splat(0.5),
                }),
        );
    }
    registry
}

fn bench_fixed_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("fixed_step");
    for &count in &[64usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::new("boxes_on_plane", count), &count, |b, &count| {
            let mut registry = build_world(count);
            // Warm up contacts and islands.
            for _ in 0..10 {
                step_simulation(&mut registry);
            }
            b.iter(|| {
                step_simulation(&mut registry);
                black_box(registry.num_manifolds());
            });
            detach(&mut registry);
        });
    }
    group.finish();
}

fn bench_raycast(c: &mut Criterion) {
    let mut registry = build_world(1024);
    for _ in 0..10 {
        step_simulation(&mut registry);
    }

    c.bench_function("raycast_1024_boxes", |b| {
        b.iter(|| {
            black_box(raycast(
                &registry,
                Vec3::new(-10.0, 0.5, 7.0),
                Vec3::new(60.0, 0.5, 7.0),
            ))
        })
    });
    detach(&mut registry);
}

criterion_group!(benches, bench_fixed_step, bench_raycast);
criterion_main!(benches);
