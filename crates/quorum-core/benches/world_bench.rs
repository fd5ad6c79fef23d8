use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use quorum_core::{QuorumConfig, World};
use std::time::Duration;

fn bench_world_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_step");
    group.sample_size(30);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(8));
    let steps = 64;
    for &ncell in &[50_usize, 200, 500] {
        group.bench_function(format!("steps{steps}_cells{ncell}"), |b| {
            b.iter_batched(
                || {
                    let config = QuorumConfig {
                        ncell,
                        food_rnd: 20,
                        food_cluster: 20,
                        rng_seed: Some(0xBEEF),
                        history_capacity: 1,
                        ..QuorumConfig::default()
                    };
                    World::new(config).expect("world")
                },
                |mut world| {
                    for _ in 0..steps {
                        world.step();
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_world_steps);
criterion_main!(benches);
