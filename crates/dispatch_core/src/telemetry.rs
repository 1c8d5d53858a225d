//! Telemetry / KPIs: counters for matching, lifecycle outcomes and self-repairs.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters. Every field is a monotonic total since start-up.
#[derive(Debug, Default)]
pub struct DispatchTelemetry {
    rides_requested: AtomicU64,
    rides_matched: AtomicU64,
    searches_without_driver: AtomicU64,
    acceptance_timeouts: AtomicU64,
    driver_declines: AtomicU64,
    rides_started: AtomicU64,
    rides_completed: AtomicU64,
    rides_cancelled: AtomicU64,
    otp_mismatches: AtomicU64,
    queue_repairs: AtomicU64,
    ledger_drift_corrections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub rides_requested: u64,
    pub rides_matched: u64,
    pub searches_without_driver: u64,
    pub acceptance_timeouts: u64,
    pub driver_declines: u64,
    pub rides_started: u64,
    pub rides_completed: u64,
    pub rides_cancelled: u64,
    pub otp_mismatches: u64,
    pub queue_repairs: u64,
    pub ledger_drift_corrections: u64,
}

impl TelemetrySnapshot {
    /// Share of match attempts that found a driver.
    pub fn match_rate(&self) -> f64 {
        let attempts = self.rides_matched + self.searches_without_driver;
        if attempts == 0 {
            return 0.0;
        }
        self.rides_matched as f64 / attempts as f64
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl DispatchTelemetry {
    pub fn ride_requested(&self) {
        bump(&self.rides_requested, 1);
    }

    pub fn ride_matched(&self) {
        bump(&self.rides_matched, 1);
    }

    pub fn search_without_driver(&self) {
        bump(&self.searches_without_driver, 1);
    }

    pub fn acceptance_timeout(&self) {
        bump(&self.acceptance_timeouts, 1);
    }

    pub fn driver_declined(&self) {
        bump(&self.driver_declines, 1);
    }

    pub fn ride_started(&self) {
        bump(&self.rides_started, 1);
    }

    pub fn ride_completed(&self) {
        bump(&self.rides_completed, 1);
    }

    pub fn ride_cancelled(&self) {
        bump(&self.rides_cancelled, 1);
    }

    pub fn otp_mismatch(&self) {
        bump(&self.otp_mismatches, 1);
    }

    pub fn queue_repaired(&self, entries: usize) {
        bump(&self.queue_repairs, entries as u64);
    }

    pub fn ledger_drift_corrected(&self) {
        bump(&self.ledger_drift_corrections, 1);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        TelemetrySnapshot {
            rides_requested: load(&self.rides_requested),
            rides_matched: load(&self.rides_matched),
            searches_without_driver: load(&self.searches_without_driver),
            acceptance_timeouts: load(&self.acceptance_timeouts),
            driver_declines: load(&self.driver_declines),
            rides_started: load(&self.rides_started),
            rides_completed: load(&self.rides_completed),
            rides_cancelled: load(&self.rides_cancelled),
            otp_mismatches: load(&self.otp_mismatches),
            queue_repairs: load(&self.queue_repairs),
            ledger_drift_corrections: load(&self.ledger_drift_corrections),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let telemetry = DispatchTelemetry::default();
        telemetry.ride_matched();
        telemetry.ride_matched();
        telemetry.ride_matched();
        telemetry.search_without_driver();
        telemetry.queue_repaired(2);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.rides_matched, 3);
        assert_eq!(snapshot.queue_repairs, 2);
        assert!((snapshot.match_rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn empty_match_rate_is_zero() {
        assert_eq!(TelemetrySnapshot::default().match_rate(), 0.0);
    }
}
