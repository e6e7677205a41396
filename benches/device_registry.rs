//! Benchmark for capacity classification and the device registry
//!
//! Target: a full 8-bay refresh well under a millisecond

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use raid_lifecycle_manager::controlplane::engine::{simulated_device, SimulatedBays};
use raid_lifecycle_manager::hardware::classification::normalize;
use raid_lifecycle_manager::hardware::registry::DeviceRegistry;
use raid_lifecycle_manager::domain::DeviceId;
use std::sync::Arc;

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("capacity");
    group.throughput(Throughput::Elements(1));

    group.bench_function("normalize", |b| {
        let mut size = 960_197_124_096u64;
        b.iter(|| {
            size = size.wrapping_add(4_096_805_658_624) % 20_000_000_000_000;
            normalize(black_box(size))
        });
    });

    group.finish();
}

fn bench_refresh(c: &mut Criterion) {
    let mut group = c.benchmark_group("device_registry");
    group.throughput(Throughput::Elements(8));

    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");

    let bays = Arc::new(SimulatedBays::uniform(8, 4_000_787_030_016));
    let registry = DeviceRegistry::new(bays.clone());

    group.bench_function("refresh_8_bays", |b| {
        b.iter(|| rt.block_on(registry.refresh()));
    });

    // A device flapping in and out of one bay
    let flapping = DeviceId::new("nvme-SIM_03");
    let mut present = true;
    group.bench_function("refresh_with_change", |b| {
        b.iter(|| {
            if present {
                bays.remove(&flapping);
            } else {
                bays.insert(simulated_device(flapping.as_str(), 3, 4_000_787_030_016));
            }
            present = !present;
            rt.block_on(registry.refresh())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_normalize, bench_refresh);
criterion_main!(benches);
