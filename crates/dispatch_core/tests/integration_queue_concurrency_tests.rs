use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use dispatch_core::clock::ManualClock;
use dispatch_core::error::DispatchError;
use dispatch_core::model::{DriverId, LocationId, PartitionKey, VehicleType};
use dispatch_core::queue::QueueManager;
use dispatch_core::telemetry::DispatchTelemetry;
use dispatch_core::test_helpers::{assigned_driver, TestDispatch, MG_ROAD};

fn manager() -> Arc<QueueManager> {
    Arc::new(QueueManager::new(
        Arc::new(ManualClock::new(0)),
        Arc::new(DispatchTelemetry::default()),
    ))
}

#[test]
fn parallel_enqueues_get_unique_positions_and_times() {
    let queue = manager();
    let station = LocationId::new(MG_ROAD);
    thread::scope(|scope| {
        for worker in 0..8 {
            let queue = &queue;
            let station = &station;
            scope.spawn(move || {
                for n in 0..50 {
                    queue
                        .enqueue(
                            &DriverId::new(format!("w{worker}-d{n}")),
                            station,
                            VehicleType::Auto,
                        )
                        .expect("enqueue");
                }
            });
        }
    });

    let key = PartitionKey::new(station.clone(), VehicleType::Auto);
    let entries = queue.snapshot(&key);
    assert_eq!(entries.len(), 400);
    let positions: HashSet<_> = entries.iter().map(|e| e.position).collect();
    assert_eq!(positions.len(), 400);
    assert!(entries
        .windows(2)
        .all(|w| w[0].entry_time < w[1].entry_time));
    assert!(queue
        .validate_integrity(&station, VehicleType::Auto)
        .is_clean());
}

#[test]
fn a_driver_wins_at_most_one_partition() {
    let queue = manager();
    let driver = DriverId::new("contested");
    let successes: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let queue = &queue;
                let driver = &driver;
                scope.spawn(move || {
                    let station = LocationId::new(format!("station-{n}"));
                    match queue.enqueue(driver, &station, VehicleType::Bike) {
                        Ok(_) => 1,
                        Err(DispatchError::AlreadyQueued { .. }) => 0,
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .sum()
    });
    assert_eq!(successes, 1);
    assert!(queue.entry_of(&driver).is_some());
}

#[test]
fn churn_leaves_index_and_partitions_in_agreement() {
    let queue = manager();
    let station = LocationId::new(MG_ROAD);
    thread::scope(|scope| {
        for worker in 0..4 {
            let queue = &queue;
            let station = &station;
            scope.spawn(move || {
                for round in 0..100 {
                    let driver = DriverId::new(format!("w{worker}-d{}", round % 5));
                    if queue.is_queued(&driver) {
                        let _ = queue.dequeue(&driver);
                    } else {
                        let _ = queue.enqueue(&driver, station, VehicleType::Cab);
                    }
                }
            });
        }
        let queue = &queue;
        let key = PartitionKey::new(station.clone(), VehicleType::Cab);
        scope.spawn(move || {
            for _ in 0..50 {
                let _ = queue.claim_head(&key, None);
            }
        });
    });

    let key = PartitionKey::new(station.clone(), VehicleType::Cab);
    let queued: HashSet<_> = queue
        .snapshot(&key)
        .into_iter()
        .map(|e| e.driver_id)
        .collect();
    for worker in 0..4 {
        for n in 0..5 {
            let driver = DriverId::new(format!("w{worker}-d{n}"));
            assert_eq!(queue.is_queued(&driver), queued.contains(&driver), "{driver}");
        }
    }
}

#[test]
fn concurrent_requests_never_share_a_driver() {
    let dispatch = TestDispatch::new();
    for n in 0..10 {
        dispatch.driver_online(&format!("d-{n}"), MG_ROAD, VehicleType::Auto);
    }

    let assigned: Vec<DriverId> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let dispatch = &dispatch;
                scope.spawn(move || {
                    (0..5)
                        .filter_map(|n| {
                            let (ride_id, events) = dispatch.request_ride(
                                &format!("c-{worker}-{n}"),
                                MG_ROAD,
                                VehicleType::Auto,
                            );
                            assigned_driver(&events, &ride_id)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().expect("worker panicked"))
            .collect()
    });

    assert_eq!(assigned.len(), 10);
    let unique: HashSet<_> = assigned.iter().collect();
    assert_eq!(unique.len(), 10);
    assert_eq!(dispatch.coordinator.rides().searching().len(), 10);
}
