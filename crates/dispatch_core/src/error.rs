use thiserror::Error;

use crate::model::{DriverId, LocationId, PartitionKey, RideId};
use crate::pricing::FareError;
use crate::ride::RideState;
use crate::store::StoreError;

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Failures reported to the immediate caller of a dispatch operation.
///
/// Queue integrity violations are not part of this enum: they are repaired in
/// place and only show up in logs and telemetry.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("driver {driver_id} is already queued at {partition}")]
    AlreadyQueued {
        driver_id: DriverId,
        partition: PartitionKey,
    },

    #[error("driver {0} is not queued")]
    NotQueued(DriverId),

    #[error("driver {driver_id} is still bound to ride {ride_id}")]
    DriverBusy { driver_id: DriverId, ride_id: RideId },

    #[error("invalid queue entry for driver {driver_id}: {reason}")]
    InvalidQueueEntry {
        driver_id: DriverId,
        reason: &'static str,
    },

    #[error("no driver available at {0}")]
    NoDriverAvailable(PartitionKey),

    #[error("ride {ride_id} cannot {action} while {current}")]
    InvalidTransition {
        ride_id: RideId,
        current: RideState,
        action: &'static str,
    },

    #[error("otp mismatch for ride {0}")]
    OtpMismatch(RideId),

    #[error("acceptance window for ride {0} has expired")]
    AcceptanceTimeout(RideId),

    #[error("driver {driver_id} is not assigned to ride {ride_id}")]
    NotAssignedDriver { ride_id: RideId, driver_id: DriverId },

    #[error("ride not found: {0}")]
    RideNotFound(RideId),

    #[error("unknown station: {0}")]
    UnknownLocation(LocationId),

    #[error("invalid coordinates ({lat}, {lng})")]
    InvalidCoordinates { lat: f64, lng: f64 },

    #[error(transparent)]
    Fare(#[from] FareError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Errors the caller may simply retry (possibly after a short wait).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::NoDriverAvailable(_)
                | DispatchError::OtpMismatch(_)
                | DispatchError::Store(StoreError::Unavailable(_))
        )
    }

    /// State the ride was left in, for guard violations.
    pub fn current_state(&self) -> Option<RideState> {
        match self {
            DispatchError::InvalidTransition { current, .. } => Some(*current),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VehicleType;

    #[test]
    fn retryable_classification() {
        let no_driver =
            DispatchError::NoDriverAvailable(PartitionKey::new("a", VehicleType::Auto));
        assert!(no_driver.is_retryable());
        assert!(DispatchError::OtpMismatch(RideId::new("r")).is_retryable());
        assert!(!DispatchError::NotQueued(DriverId::new("d")).is_retryable());
    }

    #[test]
    fn invalid_transition_reports_state() {
        let err = DispatchError::InvalidTransition {
            ride_id: RideId::new("r-1"),
            current: RideState::Started,
            action: "cancel",
        };
        assert_eq!(err.current_state(), Some(RideState::Started));
        assert_eq!(err.to_string(), "ride r-1 cannot cancel while started");
    }
}
