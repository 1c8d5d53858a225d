use std::sync::Arc;
use std::time::Duration;

use dispatch_core::clock::ManualClock;
use dispatch_core::coordinator::DispatchCoordinator;
use dispatch_core::events::{InboundEvent, OutboundEvent, ReassignReason};
use dispatch_core::model::{CustomerId, DriverId, LocationId, RideId, VehicleType};
use dispatch_core::store::InMemoryHistoryStore;
use dispatch_core::test_helpers::{
    test_config, test_drop, SequentialOtpGenerator, MG_ROAD, TEST_START_MS,
};
use dispatch_runtime::{Delivery, DispatchService, RuntimeConfig};
use tokio::sync::mpsc;

fn coordinator(clock: Arc<ManualClock>) -> Arc<DispatchCoordinator> {
    let coordinator = DispatchCoordinator::from_config(
        &test_config(),
        clock,
        Arc::new(InMemoryHistoryStore::new()),
    )
    .expect("valid config")
    .with_otp_generator(Box::new(SequentialOtpGenerator::new(4)));
    Arc::new(coordinator)
}

fn online(driver: &str) -> InboundEvent {
    InboundEvent::DriverOnline {
        driver_id: DriverId::new(driver),
        location_id: LocationId::new(MG_ROAD),
        vehicle_type: VehicleType::Auto,
    }
}

fn request(customer: &str) -> InboundEvent {
    InboundEvent::RideRequested {
        customer_id: CustomerId::new(customer),
        pickup_location_id: LocationId::new(MG_ROAD),
        drop_location: test_drop(),
        vehicle_type: VehicleType::Auto,
    }
}

fn single_worker(tick_ms: u64) -> RuntimeConfig {
    RuntimeConfig::default()
        .with_workers(1)
        .with_tick_interval(Duration::from_millis(tick_ms))
}

async fn drain(mut rx: mpsc::Receiver<Delivery>) -> Vec<Delivery> {
    let mut out = Vec::new();
    while let Some(delivery) = rx.recv().await {
        out.push(delivery);
    }
    out
}

fn events(deliveries: &[Delivery]) -> Vec<OutboundEvent> {
    deliveries
        .iter()
        .filter_map(|delivery| match delivery {
            Delivery::Event { event } => Some(event.clone()),
            Delivery::Rejected { .. } => None,
        })
        .collect()
}

#[tokio::test]
async fn request_is_matched_to_online_driver() {
    let clock = Arc::new(ManualClock::new(TEST_START_MS));
    let (service, rx) = DispatchService::start(coordinator(clock), single_worker(60_000));

    service.submit(online("d1")).await.expect("submit");
    service.submit(request("c1")).await.expect("submit");
    service.shutdown().await.expect("shutdown");

    let events = events(&drain(rx).await);
    assert!(events.iter().any(|event| matches!(
        event,
        OutboundEvent::RideAssigned { driver_id, .. } if driver_id.as_str() == "d1"
    )));
}

#[tokio::test]
async fn rejected_events_are_delivered() {
    let clock = Arc::new(ManualClock::new(TEST_START_MS));
    let (service, rx) = DispatchService::start(coordinator(clock), single_worker(60_000));

    service
        .submit(InboundEvent::RideAccept {
            driver_id: DriverId::new("d1"),
            ride_id: RideId::new("ride-999999"),
        })
        .await
        .expect("submit");
    service.shutdown().await.expect("shutdown");

    let deliveries = drain(rx).await;
    let rejection = deliveries
        .iter()
        .find_map(|delivery| match delivery {
            Delivery::Rejected {
                session,
                event,
                retryable,
                ..
            } => Some((session.clone(), *event, *retryable)),
            Delivery::Event { .. } => None,
        })
        .expect("rejection");
    assert_eq!(rejection, ("ride-999999".to_string(), "ride_accept", false));
}

#[tokio::test]
async fn ticker_reassigns_after_acceptance_timeout() {
    let clock = Arc::new(ManualClock::new(TEST_START_MS));
    let (service, mut rx) =
        DispatchService::start(coordinator(clock.clone()), single_worker(10));

    service.submit(online("d1")).await.expect("submit");
    service.submit(online("d2")).await.expect("submit");
    service.submit(request("c1")).await.expect("submit");

    let assigned_first = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(delivery) = rx.recv().await {
            if let Delivery::Event {
                event: OutboundEvent::RideAssigned { .. },
            } = delivery
            {
                return true;
            }
        }
        false
    })
    .await
    .expect("first assignment in time");
    assert!(assigned_first);

    clock.advance_ms(31_000);

    let reassigned = tokio::time::timeout(Duration::from_secs(5), async {
        let mut reassigning = None;
        while let Some(Delivery::Event { event }) = rx.recv().await {
            match event {
                OutboundEvent::RideReassigning {
                    driver_id, reason, ..
                } => reassigning = Some((driver_id, reason)),
                OutboundEvent::RideAssigned { driver_id, .. } if reassigning.is_some() => {
                    return (reassigning, driver_id);
                }
                _ => {}
            }
        }
        (reassigning, DriverId::new(""))
    })
    .await
    .expect("reassignment in time");

    assert_eq!(
        reassigned.0,
        Some((DriverId::new("d1"), ReassignReason::AcceptanceTimeout))
    );
    assert_eq!(reassigned.1, DriverId::new("d2"));

    service.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn shard_choice_is_stable_per_session() {
    let clock = Arc::new(ManualClock::new(TEST_START_MS));
    let config = RuntimeConfig::default().with_workers(8);
    let (service, _rx) = DispatchService::start(coordinator(clock), config);

    let first = service.shard_for("driver-42");
    assert_eq!(first, service.shard_for("driver-42"));
    assert!(first < 8);

    service.shutdown().await.expect("shutdown");
}
