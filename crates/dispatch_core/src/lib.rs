//! Core of a station-based ride dispatch service: per-station driver queues,
//! the ride state machine, fare computation and driver earnings.
//!
//! [`coordinator::DispatchCoordinator`] is the entry point. It takes
//! [`events::InboundEvent`]s and returns the [`events::OutboundEvent`]s to
//! deliver; transport and persistence sit outside this crate.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod ledger;
pub mod model;
pub mod pricing;
pub mod queue;
pub mod ride;
pub mod spatial;
pub mod store;
pub mod telemetry;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
