//! Performance benchmarks for dispatch_core using Criterion.rs.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dispatch_core::clock::ManualClock;
use dispatch_core::model::{DriverId, LocationId, PartitionKey, VehicleType};
use dispatch_core::pricing::{FareEngine, PricingPolicy};
use dispatch_core::queue::{QueueEntry, QueueManager};
use dispatch_core::telemetry::DispatchTelemetry;
use dispatch_core::test_helpers::{TestDispatch, MG_ROAD};

fn bench_fare_quote(c: &mut Criterion) {
    let engine = FareEngine::default();
    let policy = PricingPolicy::default();
    let mut group = c.benchmark_group("fare_quote");
    for vehicle_type in VehicleType::ALL {
        group.bench_with_input(
            BenchmarkId::from_parameter(vehicle_type),
            &vehicle_type,
            |b, &vehicle_type| {
                b.iter(|| {
                    black_box(engine.quote(
                        vehicle_type,
                        black_box(7.3),
                        black_box(1.4),
                        &policy,
                    ))
                });
            },
        );
    }
    group.finish();
}

fn bench_enqueue_claim(c: &mut Criterion) {
    let sizes = vec![("small", 50), ("medium", 500), ("large", 5_000)];
    let mut group = c.benchmark_group("enqueue_claim");
    for (name, drivers) in sizes {
        group.bench_with_input(BenchmarkId::from_parameter(name), &drivers, |b, &drivers| {
            b.iter(|| {
                let queue = QueueManager::new(
                    Arc::new(ManualClock::new(0)),
                    Arc::new(DispatchTelemetry::default()),
                );
                let station = LocationId::new(MG_ROAD);
                let key = PartitionKey::new(station.clone(), VehicleType::Auto);
                for n in 0..drivers {
                    let driver_id = DriverId::new(format!("d-{n}"));
                    let _ = queue.enqueue(&driver_id, &station, VehicleType::Auto);
                }
                while let Some(entry) = queue.claim_head(&key, None) {
                    black_box(entry);
                }
            });
        });
    }
    group.finish();
}

fn bench_repair(c: &mut Criterion) {
    let corrupted: Vec<QueueEntry> = (0..1_000u32)
        .map(|n| QueueEntry {
            driver_id: DriverId::new(format!("d-{n}")),
            location_id: LocationId::new(MG_ROAD),
            vehicle_type: VehicleType::Bike,
            position: n / 3 + 1,
            entry_time: (n % 7 != 0).then_some(u64::from(n)),
        })
        .collect();
    let key = PartitionKey::new(MG_ROAD, VehicleType::Bike);

    c.bench_function("repair_1000_entries", |b| {
        b.iter(|| {
            let queue = QueueManager::new(
                Arc::new(ManualClock::new(10_000)),
                Arc::new(DispatchTelemetry::default()),
            );
            queue
                .load_partition(&key, corrupted.clone())
                .expect("load corrupted partition");
            black_box(queue.repair(&key))
        });
    });
}

fn bench_ride_round_trip(c: &mut Criterion) {
    c.bench_function("ride_round_trip", |b| {
        b.iter(|| {
            let dispatch = TestDispatch::new();
            dispatch.driver_online("d-1", MG_ROAD, VehicleType::Auto);
            let (ride_id, _) = dispatch.request_ride("c-1", MG_ROAD, VehicleType::Auto);
            black_box(dispatch.drive_to_end(&ride_id, "d-1"))
        });
    });
}

criterion_group!(
    benches,
    bench_fare_quote,
    bench_enqueue_claim,
    bench_repair,
    bench_ride_round_trip
);
criterion_main!(benches);
