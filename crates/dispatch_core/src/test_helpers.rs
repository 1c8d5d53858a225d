//! Test helpers shared by unit tests, integration tests and benches.
//!
//! The fixture geography is two Bengaluru metro stations about 3.9 km apart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::ManualClock;
use crate::config::DispatchConfig;
use crate::coordinator::DispatchCoordinator;
use crate::error::DispatchResult;
use crate::events::{InboundEvent, OutboundEvent};
use crate::model::{CustomerId, DriverId, GeoPoint, LocationId, RideId, VehicleType};
use crate::ride::{OtpGenerator, Ride};
use crate::store::InMemoryHistoryStore;

pub const MG_ROAD: &str = "mg-road";
pub const INDIRANAGAR: &str = "indiranagar";

/// Start time of the manual clock in every fixture.
pub const TEST_START_MS: u64 = 1_700_000_000_000;

/// A drop point near Indiranagar metro, used as the default destination.
pub fn test_drop() -> GeoPoint {
    GeoPoint::new(12.9784, 77.6408)
}

/// Two stations, default tariffs and pricing, 30 s acceptance window.
pub fn test_config() -> DispatchConfig {
    DispatchConfig::default()
        .with_station(MG_ROAD, "MG Road", 12.9756, 77.6050)
        .with_station(INDIRANAGAR, "Indiranagar", 12.9784, 77.6408)
}

/// Predictable codes: `0001`, `0002`, ... in issue order.
#[derive(Debug)]
pub struct SequentialOtpGenerator {
    digits: u8,
    next: AtomicU64,
}

impl SequentialOtpGenerator {
    pub fn new(digits: u8) -> Self {
        Self {
            digits,
            next: AtomicU64::new(1),
        }
    }
}

impl OtpGenerator for SequentialOtpGenerator {
    fn generate(&self) -> String {
        let code = self.next.fetch_add(1, Ordering::SeqCst) % 10u64.pow(u32::from(self.digits));
        format!("{:0width$}", code, width = usize::from(self.digits))
    }
}

/// A coordinator wired to a manual clock and an in-memory history store.
pub struct TestDispatch {
    pub clock: Arc<ManualClock>,
    pub history: Arc<InMemoryHistoryStore>,
    pub coordinator: DispatchCoordinator,
}

impl TestDispatch {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// # Panics
    ///
    /// Panics if the config is invalid.
    pub fn with_config(config: DispatchConfig) -> Self {
        Self::with_history(config, InMemoryHistoryStore::new())
    }

    /// # Panics
    ///
    /// Panics if the config is invalid.
    pub fn with_history(config: DispatchConfig, history: InMemoryHistoryStore) -> Self {
        let clock = Arc::new(ManualClock::new(TEST_START_MS));
        let history = Arc::new(history);
        let coordinator = DispatchCoordinator::from_config(&config, clock.clone(), history.clone())
            .expect("test config should be valid")
            .with_otp_generator(Box::new(SequentialOtpGenerator::new(config.otp_digits)));
        Self {
            clock,
            history,
            coordinator,
        }
    }

    pub fn try_send(&self, event: InboundEvent) -> DispatchResult<Vec<OutboundEvent>> {
        self.coordinator.handle(event)
    }

    /// # Panics
    ///
    /// Panics if the coordinator rejects the event.
    pub fn send(&self, event: InboundEvent) -> Vec<OutboundEvent> {
        let name = event.name();
        self.coordinator
            .handle(event)
            .unwrap_or_else(|err| panic!("{name} rejected: {err}"))
    }

    pub fn driver_online(
        &self,
        driver: &str,
        station: &str,
        vehicle_type: VehicleType,
    ) -> Vec<OutboundEvent> {
        self.send(InboundEvent::DriverOnline {
            driver_id: DriverId::new(driver),
            location_id: LocationId::new(station),
            vehicle_type,
        })
    }

    /// Requests a ride from `station` to [`test_drop`] and returns its id.
    ///
    /// # Panics
    ///
    /// Panics if no `ride_created` event comes back.
    pub fn request_ride(
        &self,
        customer: &str,
        station: &str,
        vehicle_type: VehicleType,
    ) -> (RideId, Vec<OutboundEvent>) {
        let events = self.send(InboundEvent::RideRequested {
            customer_id: CustomerId::new(customer),
            pickup_location_id: LocationId::new(station),
            drop_location: test_drop(),
            vehicle_type,
        });
        let ride_id = events
            .iter()
            .find_map(|event| match event {
                OutboundEvent::RideCreated { ride_id, .. } => Some(ride_id.clone()),
                _ => None,
            })
            .expect("ride_created event");
        (ride_id, events)
    }

    /// Accepts, starts and ends a ride that is currently assigned to `driver`.
    pub fn drive_to_end(&self, ride_id: &RideId, driver: &str) -> Vec<OutboundEvent> {
        let mut events = self.send(InboundEvent::RideAccept {
            driver_id: DriverId::new(driver),
            ride_id: ride_id.clone(),
        });
        let start_otp = start_code(&events).expect("ride_accept_confirmed event");
        let started = self.send(InboundEvent::OtpStartSubmit {
            ride_id: ride_id.clone(),
            code: start_otp,
        });
        let end_otp = end_code(&started).expect("ride_started event");
        events.extend(started);
        events.extend(self.send(InboundEvent::OtpEndSubmit {
            ride_id: ride_id.clone(),
            code: end_otp,
        }));
        events
    }

    /// # Panics
    ///
    /// Panics if the ride is unknown.
    pub fn ride(&self, ride_id: &RideId) -> Ride {
        self.coordinator
            .rides()
            .get(ride_id)
            .unwrap_or_else(|| panic!("ride {ride_id} should exist"))
    }
}

impl Default for TestDispatch {
    fn default() -> Self {
        Self::new()
    }
}

/// The driver a ride was offered to, if the events contain an assignment.
pub fn assigned_driver(events: &[OutboundEvent], ride_id: &RideId) -> Option<DriverId> {
    events.iter().find_map(|event| match event {
        OutboundEvent::RideAssigned {
            ride_id: assigned,
            driver_id,
            ..
        } if assigned == ride_id => Some(driver_id.clone()),
        _ => None,
    })
}

pub fn start_code(events: &[OutboundEvent]) -> Option<String> {
    events.iter().find_map(|event| match event {
        OutboundEvent::RideAcceptConfirmed { start_otp, .. } => Some(start_otp.clone()),
        _ => None,
    })
}

pub fn end_code(events: &[OutboundEvent]) -> Option<String> {
    events.iter().find_map(|event| match event {
        OutboundEvent::RideStarted { end_otp_hint, .. } => Some(end_otp_hint.clone()),
        _ => None,
    })
}
