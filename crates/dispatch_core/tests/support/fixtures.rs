#![allow(dead_code)]

use dispatch_core::events::{InboundEvent, OutboundEvent};
use dispatch_core::model::{
    CustomerId, DriverId, LocationId, Money, RideId, Timestamp, VehicleType,
};
use dispatch_core::queue::QueueEntry;
use dispatch_core::ride::RideState;
use dispatch_core::store::RideRecord;
use dispatch_core::test_helpers::TestDispatch;

/// Brings `count` drivers named `{prefix}-{n}` online at `station`, in order.
pub fn drivers_online(
    dispatch: &TestDispatch,
    prefix: &str,
    count: usize,
    station: &str,
    vehicle_type: VehicleType,
) -> Vec<DriverId> {
    (1..=count)
        .map(|n| {
            let driver = format!("{prefix}-{n}");
            dispatch.driver_online(&driver, station, vehicle_type);
            dispatch.clock.advance_ms(1_000);
            DriverId::new(driver)
        })
        .collect()
}

pub fn accept(dispatch: &TestDispatch, ride_id: &RideId, driver_id: &DriverId) -> Vec<OutboundEvent> {
    dispatch.send(InboundEvent::RideAccept {
        driver_id: driver_id.clone(),
        ride_id: ride_id.clone(),
    })
}

pub fn complete(dispatch: &TestDispatch, ride_id: &RideId) -> Vec<OutboundEvent> {
    dispatch.send(InboundEvent::RideComplete {
        ride_id: ride_id.clone(),
    })
}

pub fn queue_entry(
    driver: &str,
    station: &str,
    vehicle_type: VehicleType,
    position: u32,
    entry_time: Option<Timestamp>,
) -> QueueEntry {
    QueueEntry {
        driver_id: DriverId::new(driver),
        location_id: LocationId::new(station),
        vehicle_type,
        position,
        entry_time,
    }
}

/// A completed history document with only the fields older writers filled in.
pub fn legacy_record(ride: &str, driver: &str, vehicle_type: VehicleType) -> RideRecord {
    RideRecord {
        ride_id: RideId::new(ride),
        driver_id: Some(DriverId::new(driver)),
        customer_id: CustomerId::new("legacy-customer"),
        vehicle_type,
        state: RideState::Completed,
        distance_km: None,
        driver_fare: None,
        customer_fare: None,
        legacy_fare: None,
        estimated_fare: None,
        finished_at: 1_600_000_000_000,
    }
}

pub fn with_driver_fare(mut record: RideRecord, amount: Money) -> RideRecord {
    record.driver_fare = Some(amount);
    record
}

pub fn with_distance(mut record: RideRecord, distance_km: f64) -> RideRecord {
    record.distance_km = Some(distance_km);
    record
}

pub fn positions(events: &[OutboundEvent]) -> Vec<(String, u32)> {
    events
        .iter()
        .filter_map(|event| match event {
            OutboundEvent::QueuePositionChanged {
                driver_id,
                position,
                ..
            } => Some((driver_id.to_string(), *position)),
            _ => None,
        })
        .collect()
}
