//! Dispatch coordinator: maps inbound events onto queue, lifecycle and ledger
//! operations and collects the outbound events they produce.

use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{ConfigError, DispatchConfig};
use crate::error::{DispatchError, DispatchResult};
use crate::events::{InboundEvent, OutboundEvent};
use crate::ledger::EarningsLedger;
use crate::model::{
    CustomerId, DriverId, GeoPoint, LocationId, PartitionKey, RideId, VehicleType,
};
use crate::pricing::{FareEngine, PricingPolicy, SurgeTable};
use crate::queue::{QueueEntry, QueueManager, RepairOutcome};
use crate::ride::{OtpGenerator, RandomOtpGenerator, RideLifecycle, RideRequest};
use crate::spatial::StationDirectory;
use crate::store::HistoryStore;
use crate::telemetry::DispatchTelemetry;

pub struct DispatchCoordinator {
    stations: StationDirectory,
    fares: FareEngine,
    policy: PricingPolicy,
    surge: Arc<SurgeTable>,
    queue: Arc<QueueManager>,
    ledger: Arc<EarningsLedger>,
    rides: RideLifecycle,
    telemetry: Arc<DispatchTelemetry>,
}

impl DispatchCoordinator {
    pub fn from_config(
        config: &DispatchConfig,
        clock: Arc<dyn Clock>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let stations = StationDirectory::new(config.resolution()?, &config.stations).map_err(
            |point| {
                ConfigError::Invalid(format!(
                    "station coordinates ({}, {}) are not a valid location",
                    point.lat, point.lng
                ))
            },
        )?;

        let surge = Arc::new(SurgeTable::new());
        for (location_id, factor) in &config.surge {
            surge
                .set(location_id.clone(), *factor)
                .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        }

        let telemetry = Arc::new(DispatchTelemetry::default());
        let fares = FareEngine::new(config.tariffs);
        let queue = Arc::new(QueueManager::new(clock.clone(), telemetry.clone()));
        let ledger = Arc::new(EarningsLedger::new(
            fares.clone(),
            config.pricing,
            history,
            telemetry.clone(),
        ));
        let rides = RideLifecycle::new(
            clock,
            queue.clone(),
            ledger.clone(),
            surge.clone(),
            telemetry.clone(),
        )
        .with_fares(fares.clone(), config.pricing)
        .with_otp_generator(Box::new(RandomOtpGenerator::new(config.otp_digits)))
        .with_acceptance_timeout_ms(config.acceptance_timeout_ms);

        info!(
            stations = stations.len(),
            acceptance_timeout_ms = config.acceptance_timeout_ms,
            "dispatch coordinator ready"
        );
        Ok(Self {
            stations,
            fares,
            policy: config.pricing,
            surge,
            queue,
            ledger,
            rides,
            telemetry,
        })
    }

    pub fn with_otp_generator(mut self, generator: Box<dyn OtpGenerator>) -> Self {
        self.rides = self.rides.with_otp_generator(generator);
        self
    }

    pub fn handle(&self, event: InboundEvent) -> DispatchResult<Vec<OutboundEvent>> {
        debug!(event = event.name(), session = event.session_key(), "handling event");
        match event {
            InboundEvent::DriverOnline {
                driver_id,
                location_id,
                vehicle_type,
            } => self.driver_online(&driver_id, &location_id, vehicle_type),
            InboundEvent::DriverOffline { driver_id } => {
                self.queue.dequeue(&driver_id)?;
                Ok(Vec::new())
            }
            InboundEvent::RideRequested {
                customer_id,
                pickup_location_id,
                drop_location,
                vehicle_type,
            } => self.request_ride(customer_id, pickup_location_id, drop_location, vehicle_type),
            InboundEvent::RideAccept { driver_id, ride_id } => self.accept(&ride_id, &driver_id),
            InboundEvent::RideDecline { driver_id, ride_id } => {
                let events = self.rides.decline(&ride_id, &driver_id)?.events;
                Ok(self.redispatch(&ride_id, events))
            }
            InboundEvent::OtpStartSubmit { ride_id, code } => {
                Ok(self.rides.submit_start_otp(&ride_id, &code)?.events)
            }
            InboundEvent::OtpEndSubmit { ride_id, code } => {
                Ok(self.rides.submit_end_otp(&ride_id, &code)?.events)
            }
            InboundEvent::RideComplete { ride_id } => Ok(self.rides.complete(&ride_id)?.events),
            InboundEvent::RideCancel { ride_id, actor } => {
                let outcome = self.rides.cancel(&ride_id, &actor)?;
                let mut events = outcome.events;
                // A released driver may serve someone already waiting.
                if let Some(key) = self.rides.get(&ride_id).map(|ride| ride.partition_key()) {
                    events.extend(self.match_waiting(&key));
                }
                Ok(events)
            }
            InboundEvent::SurgeUpdated {
                location_id,
                factor,
            } => {
                self.known_station(&location_id)?;
                self.surge.set(location_id.clone(), factor)?;
                info!(location_id = %location_id, factor, "surge updated");
                Ok(Vec::new())
            }
        }
    }

    /// Periodic work: retries rides still searching, then reclaims rides whose
    /// acceptance window has elapsed and offers them to the next driver.
    pub fn tick(&self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        for ride_id in self.rides.searching() {
            match self.assign(&ride_id, false) {
                Ok(assigned) => events.extend(assigned),
                Err(err) => debug!(ride_id = %ride_id, error = %err, "retry skipped"),
            }
        }
        for expired in self.rides.expire_due() {
            events.extend(self.redispatch(&expired.ride_id, expired.events));
        }
        events
    }

    /// Replaces a queue partition with persisted entries and repairs it.
    pub fn restore_queue(
        &self,
        key: &PartitionKey,
        entries: Vec<QueueEntry>,
    ) -> DispatchResult<Vec<OutboundEvent>> {
        self.known_station(&key.location_id)?;
        self.queue.load_partition(key, entries)?;
        let mut events = self.repair_events(key);
        events.extend(self.match_waiting(key));
        Ok(events)
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub fn rides(&self) -> &RideLifecycle {
        &self.rides
    }

    pub fn ledger(&self) -> &EarningsLedger {
        &self.ledger
    }

    pub fn surge(&self) -> &SurgeTable {
        &self.surge
    }

    pub fn stations(&self) -> &StationDirectory {
        &self.stations
    }

    pub fn telemetry(&self) -> &DispatchTelemetry {
        &self.telemetry
    }

    fn driver_online(
        &self,
        driver_id: &DriverId,
        location_id: &LocationId,
        vehicle_type: VehicleType,
    ) -> DispatchResult<Vec<OutboundEvent>> {
        self.known_station(location_id)?;
        if let Some(ride_id) = self.rides.active_ride_of(driver_id) {
            return Err(DispatchError::DriverBusy {
                driver_id: driver_id.clone(),
                ride_id,
            });
        }
        let key = PartitionKey::new(location_id.clone(), vehicle_type);
        let mut events = self.repair_events(&key);
        let entry = self.queue.enqueue(driver_id, location_id, vehicle_type)?;
        events.push(position_event(entry));
        events.extend(self.match_waiting(&key));
        Ok(events)
    }

    fn request_ride(
        &self,
        customer_id: CustomerId,
        pickup_location_id: LocationId,
        drop_location: GeoPoint,
        vehicle_type: VehicleType,
    ) -> DispatchResult<Vec<OutboundEvent>> {
        let distance_km = self
            .stations
            .trip_distance_km(&pickup_location_id, drop_location)?;
        let surge = self.surge.factor(&pickup_location_id);
        let estimate = self
            .fares
            .quote(vehicle_type, distance_km, surge, &self.policy)?;
        let ride = self.rides.create(RideRequest {
            customer_id: customer_id.clone(),
            pickup_location_id,
            drop_location,
            vehicle_type,
            distance_km,
            estimated_fare: Some(estimate.customer_fare),
        });

        let mut events = vec![OutboundEvent::RideCreated {
            ride_id: ride.ride_id.clone(),
            customer_id,
            distance_km,
            estimated_fare: estimate.customer_fare,
        }];
        events.extend(self.dispatch(&ride.ride_id)?);
        Ok(events)
    }

    fn accept(
        &self,
        ride_id: &RideId,
        driver_id: &DriverId,
    ) -> DispatchResult<Vec<OutboundEvent>> {
        match self.rides.accept(ride_id, driver_id) {
            Ok(outcome) => Ok(outcome.events),
            Err(DispatchError::AcceptanceTimeout(_)) => {
                // Too late: reclaim now rather than waiting for the next tick.
                let events = self
                    .rides
                    .expire_acceptance(ride_id)
                    .map(|outcome| outcome.events)
                    .unwrap_or_default();
                Ok(self.redispatch(ride_id, events))
            }
            Err(err) => Err(err),
        }
    }

    /// Attempts one match for a `requested` ride, announcing a search when no
    /// driver is free.
    fn dispatch(&self, ride_id: &RideId) -> DispatchResult<Vec<OutboundEvent>> {
        self.assign(ride_id, true)
    }

    /// Offers a reclaimed ride to the next driver. A failed attempt is logged
    /// and the events that reclaimed the ride are returned regardless.
    fn redispatch(&self, ride_id: &RideId, mut events: Vec<OutboundEvent>) -> Vec<OutboundEvent> {
        match self.dispatch(ride_id) {
            Ok(assigned) => events.extend(assigned),
            Err(err) => debug!(ride_id = %ride_id, error = %err, "reassignment skipped"),
        }
        events
    }

    fn assign(
        &self,
        ride_id: &RideId,
        announce_search: bool,
    ) -> DispatchResult<Vec<OutboundEvent>> {
        let Some(ride) = self.rides.get(ride_id) else {
            return Err(DispatchError::RideNotFound(ride_id.clone()));
        };
        let mut events = self.repair_events(&ride.partition_key());
        match self.rides.try_assign(ride_id) {
            Ok(outcome) => events.extend(outcome.events),
            Err(DispatchError::NoDriverAvailable(_)) => {
                if announce_search {
                    events.push(OutboundEvent::RideSearching {
                        ride_id: ride_id.clone(),
                    });
                }
            }
            Err(err) => return Err(err),
        }
        Ok(events)
    }

    /// Offers newly available drivers in a partition to the oldest waiting rides.
    fn match_waiting(&self, key: &PartitionKey) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        for ride_id in self.rides.searching_at(key) {
            if self.queue.len(key) == 0 {
                break;
            }
            match self.rides.try_assign(&ride_id) {
                Ok(outcome) => events.extend(outcome.events),
                Err(err) => debug!(ride_id = %ride_id, error = %err, "waiting ride not matched"),
            }
        }
        events
    }

    fn repair_events(&self, key: &PartitionKey) -> Vec<OutboundEvent> {
        let RepairOutcome { reassigned, .. } = self.queue.ensure_integrity(key);
        reassigned
            .into_iter()
            .filter_map(|moved| self.queue.entry_of(&moved.driver_id))
            .map(position_event)
            .collect()
    }

    fn known_station(&self, location_id: &LocationId) -> DispatchResult<()> {
        if self.stations.contains(location_id) {
            Ok(())
        } else {
            Err(DispatchError::UnknownLocation(location_id.clone()))
        }
    }
}

fn position_event(entry: QueueEntry) -> OutboundEvent {
    OutboundEvent::QueuePositionChanged {
        driver_id: entry.driver_id,
        location_id: entry.location_id,
        vehicle_type: entry.vehicle_type,
        position: entry.position,
    }
}
