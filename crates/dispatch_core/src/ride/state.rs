use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a ride.
///
/// ```text
/// requested -> assigned -> accepted -> started -> ended -> completed
///     ^            |
///     +------------+  decline / acceptance timeout
/// requested | assigned | accepted -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideState {
    Requested,
    Assigned,
    Accepted,
    Started,
    Ended,
    Completed,
    Cancelled,
}

impl RideState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideState::Requested => "requested",
            RideState::Assigned => "assigned",
            RideState::Accepted => "accepted",
            RideState::Started => "started",
            RideState::Ended => "ended",
            RideState::Completed => "completed",
            RideState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RideState::Completed | RideState::Cancelled)
    }

    /// Cancellation is only possible before the trip starts.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            RideState::Requested | RideState::Assigned | RideState::Accepted
        )
    }

    /// States in which a driver is bound to the ride.
    pub fn holds_driver(&self) -> bool {
        matches!(
            self,
            RideState::Assigned | RideState::Accepted | RideState::Started | RideState::Ended
        )
    }

    /// The fare is frozen from `started` onwards.
    pub fn has_fare(&self) -> bool {
        matches!(
            self,
            RideState::Started | RideState::Ended | RideState::Completed
        )
    }

    pub fn can_transition_to(&self, next: RideState) -> bool {
        use RideState::*;
        matches!(
            (self, next),
            (Requested, Assigned)
                | (Assigned, Accepted)
                | (Assigned, Requested)
                | (Accepted, Started)
                | (Started, Ended)
                | (Ended, Completed)
                | (Requested, Cancelled)
                | (Assigned, Cancelled)
                | (Accepted, Cancelled)
        )
    }
}

impl fmt::Display for RideState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
