//! Rides and their state machine.

mod lifecycle;
mod otp;
mod state;

use serde::{Deserialize, Serialize};

use crate::events::OutboundEvent;
use crate::model::{
    CustomerId, DriverId, GeoPoint, LocationId, Money, PartitionKey, RideId, Timestamp,
    VehicleType,
};
use crate::pricing::FareQuote;
use crate::store::RideRecord;

pub use lifecycle::RideLifecycle;
pub use otp::{ExactMatchVerifier, OtpGenerator, OtpVerifier, RandomOtpGenerator};
pub use state::RideState;

/// What a customer asks for. Distance and the estimate are resolved by the
/// coordinator before the ride exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    pub customer_id: CustomerId,
    pub pickup_location_id: LocationId,
    pub drop_location: GeoPoint,
    pub vehicle_type: VehicleType,
    pub distance_km: f64,
    pub estimated_fare: Option<Money>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideTimestamps {
    pub requested_at: Timestamp,
    pub assigned_at: Option<Timestamp>,
    pub accepted_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub cancelled_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub ride_id: RideId,
    pub customer_id: CustomerId,
    pub pickup_location_id: LocationId,
    pub drop_location: GeoPoint,
    pub vehicle_type: VehicleType,
    pub state: RideState,
    pub driver_id: Option<DriverId>,
    pub distance_km: f64,
    pub estimated_fare: Option<Money>,
    /// Outstanding start code; cleared once it has been used.
    pub start_otp: Option<String>,
    pub end_otp: Option<String>,
    /// Frozen at `started`.
    pub fare: Option<FareQuote>,
    pub acceptance_deadline: Option<Timestamp>,
    /// Driver passed over on the next match attempt only.
    pub skip_driver: Option<DriverId>,
    pub cancel_reason: Option<String>,
    /// Driver that was bound when the ride was cancelled.
    #[serde(default)]
    pub released_driver: Option<DriverId>,
    pub timestamps: RideTimestamps,
}

impl Ride {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.pickup_location_id.clone(), self.vehicle_type)
    }

    /// History document for a ride that has reached a terminal state.
    pub fn to_record(&self, finished_at: Timestamp) -> RideRecord {
        RideRecord {
            ride_id: self.ride_id.clone(),
            driver_id: self.driver_id.clone(),
            customer_id: self.customer_id.clone(),
            vehicle_type: self.vehicle_type,
            state: self.state,
            distance_km: Some(self.distance_km),
            driver_fare: self.fare.map(|f| f.driver_fare),
            customer_fare: self.fare.map(|f| f.customer_fare),
            legacy_fare: None,
            estimated_fare: self.estimated_fare,
            finished_at,
        }
    }
}

/// Result of one lifecycle operation: where the ride ended up, and what to tell
/// the parties. An empty event list means nothing changed.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub ride_id: RideId,
    pub state: RideState,
    pub events: Vec<OutboundEvent>,
}

impl TransitionOutcome {
    fn unchanged(ride: &Ride) -> Self {
        Self {
            ride_id: ride.ride_id.clone(),
            state: ride.state,
            events: Vec::new(),
        }
    }

    pub fn changed(&self) -> bool {
        !self.events.is_empty()
    }
}
