//! Typed message contract between the transport layer and the coordinator.

use serde::{Deserialize, Serialize};

use crate::model::{
    Actor, CustomerId, DriverId, GeoPoint, LocationId, Money, RideId, Timestamp, VehicleType,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    DriverOnline {
        driver_id: DriverId,
        location_id: LocationId,
        vehicle_type: VehicleType,
    },
    DriverOffline {
        driver_id: DriverId,
    },
    RideRequested {
        customer_id: CustomerId,
        pickup_location_id: LocationId,
        drop_location: GeoPoint,
        vehicle_type: VehicleType,
    },
    RideAccept {
        driver_id: DriverId,
        ride_id: RideId,
    },
    RideDecline {
        driver_id: DriverId,
        ride_id: RideId,
    },
    OtpStartSubmit {
        ride_id: RideId,
        code: String,
    },
    OtpEndSubmit {
        ride_id: RideId,
        code: String,
    },
    /// Completion confirmed (e.g. payment acknowledged).
    RideComplete {
        ride_id: RideId,
    },
    RideCancel {
        ride_id: RideId,
        actor: Actor,
    },
    SurgeUpdated {
        location_id: LocationId,
        factor: f64,
    },
}

impl InboundEvent {
    /// Key of the session that produced the event. Events sharing a key must
    /// be handled in arrival order; different keys may run in parallel.
    pub fn session_key(&self) -> &str {
        match self {
            InboundEvent::DriverOnline { driver_id, .. }
            | InboundEvent::DriverOffline { driver_id } => driver_id.as_str(),
            InboundEvent::RideRequested { customer_id, .. } => customer_id.as_str(),
            InboundEvent::RideAccept { ride_id, .. }
            | InboundEvent::RideDecline { ride_id, .. }
            | InboundEvent::OtpStartSubmit { ride_id, .. }
            | InboundEvent::OtpEndSubmit { ride_id, .. }
            | InboundEvent::RideComplete { ride_id }
            | InboundEvent::RideCancel { ride_id, .. } => ride_id.as_str(),
            InboundEvent::SurgeUpdated { location_id, .. } => location_id.as_str(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::DriverOnline { .. } => "driver_online",
            InboundEvent::DriverOffline { .. } => "driver_offline",
            InboundEvent::RideRequested { .. } => "ride_requested",
            InboundEvent::RideAccept { .. } => "ride_accept",
            InboundEvent::RideDecline { .. } => "ride_decline",
            InboundEvent::OtpStartSubmit { .. } => "otp_start_submit",
            InboundEvent::OtpEndSubmit { .. } => "otp_end_submit",
            InboundEvent::RideComplete { .. } => "ride_complete",
            InboundEvent::RideCancel { .. } => "ride_cancel",
            InboundEvent::SurgeUpdated { .. } => "surge_updated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassignReason {
    Declined,
    AcceptanceTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    RideCreated {
        ride_id: RideId,
        customer_id: CustomerId,
        distance_km: f64,
        estimated_fare: Money,
    },
    /// No driver free right now; the ride stays requested and is retried.
    RideSearching {
        ride_id: RideId,
    },
    RideAssigned {
        ride_id: RideId,
        driver_id: DriverId,
        accept_by: Timestamp,
    },
    RideReassigning {
        ride_id: RideId,
        driver_id: DriverId,
        reason: ReassignReason,
    },
    RideAcceptConfirmed {
        ride_id: RideId,
        driver_id: DriverId,
        /// Shown to the customer, who reads it out to the driver at pickup.
        start_otp: String,
    },
    RideStarted {
        ride_id: RideId,
        end_otp_hint: String,
    },
    RideEnded {
        ride_id: RideId,
    },
    RideCompleted {
        ride_id: RideId,
        driver_id: DriverId,
        driver_fare: Money,
        customer_fare: Money,
    },
    RideCancelled {
        ride_id: RideId,
        reason: String,
    },
    QueuePositionChanged {
        driver_id: DriverId,
        location_id: LocationId,
        vehicle_type: VehicleType,
        position: u32,
    },
}

impl OutboundEvent {
    pub fn ride_id(&self) -> Option<&RideId> {
        match self {
            OutboundEvent::RideCreated { ride_id, .. }
            | OutboundEvent::RideSearching { ride_id }
            | OutboundEvent::RideAssigned { ride_id, .. }
            | OutboundEvent::RideReassigning { ride_id, .. }
            | OutboundEvent::RideAcceptConfirmed { ride_id, .. }
            | OutboundEvent::RideStarted { ride_id, .. }
            | OutboundEvent::RideEnded { ride_id }
            | OutboundEvent::RideCompleted { ride_id, .. }
            | OutboundEvent::RideCancelled { ride_id, .. } => Some(ride_id),
            OutboundEvent::QueuePositionChanged { .. } => None,
        }
    }
}
