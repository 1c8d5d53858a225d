//! Driver earnings: a cached aggregate over completed ride history.
//!
//! The cache is advisory. [`EarningsLedger::recompute`] folds the history store
//! again and overwrites the cache, which is how drift from partial writes or
//! legacy data gets corrected without downtime.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DispatchResult;
use crate::model::{DriverId, Money, VehicleType};
use crate::pricing::{round_money, FareEngine, PricingPolicy};
use crate::ride::RideState;
use crate::store::{HistoryStore, RideRecord};
use crate::telemetry::DispatchTelemetry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverEarningsRecord {
    pub driver_id: DriverId,
    pub total_earnings: Money,
    pub total_rides: u64,
}

impl DriverEarningsRecord {
    fn empty(driver_id: DriverId) -> Self {
        Self {
            driver_id,
            total_earnings: 0,
            total_rides: 0,
        }
    }
}

/// Where a history record's driver amount came from, in order of precedence.
///
/// 1. `Exact`: the record carries `driver_fare`. Always wins.
/// 2. `Recomputed`: vehicle type and distance are known, so the tariff gives
///    the exact driver fare (it does not depend on surge).
/// 3. `LegacyFare`: the single `fare` field of pre-split documents.
/// 4. `EstimatedFare`: the customer estimate with commission and GST backed
///    out at surge 1.0, floored at the vehicle minimum.
/// 5. `VehicleMinimum`: nothing usable; the vehicle's minimum fare.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FareSource {
    Exact { amount: Money },
    Recomputed { vehicle_type: VehicleType, distance_km: f64, amount: Money },
    LegacyFare { amount: Money },
    EstimatedFare { estimate: Money, amount: Money },
    VehicleMinimum { vehicle_type: VehicleType, amount: Money },
}

impl FareSource {
    pub fn amount(&self) -> Money {
        match self {
            FareSource::Exact { amount }
            | FareSource::Recomputed { amount, .. }
            | FareSource::LegacyFare { amount }
            | FareSource::EstimatedFare { amount, .. }
            | FareSource::VehicleMinimum { amount, .. } => *amount,
        }
    }

    pub fn resolve(record: &RideRecord, engine: &FareEngine, policy: &PricingPolicy) -> Self {
        if let Some(amount) = record.driver_fare {
            return FareSource::Exact { amount };
        }
        if let Some(distance_km) = record.distance_km {
            if let Ok(amount) = engine.driver_fare_for(record.vehicle_type, distance_km) {
                return FareSource::Recomputed {
                    vehicle_type: record.vehicle_type,
                    distance_km,
                    amount,
                };
            }
        }
        if let Some(amount) = record.legacy_fare {
            return FareSource::LegacyFare { amount };
        }
        let minimum = engine.min_fare(record.vehicle_type);
        if let Some(estimate) = record.estimated_fare {
            let markup = (1.0 + policy.commission_pct / 100.0) * (1.0 + policy.gst_pct / 100.0);
            let amount = round_money(estimate as f64 / markup).max(minimum);
            return FareSource::EstimatedFare { estimate, amount };
        }
        FareSource::VehicleMinimum {
            vehicle_type: record.vehicle_type,
            amount: minimum,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecomputeOutcome {
    /// Cached value before the rebuild (`None` if the driver had no cache entry).
    pub previous: Option<DriverEarningsRecord>,
    pub current: DriverEarningsRecord,
}

impl RecomputeOutcome {
    pub fn drifted(&self) -> bool {
        self.previous
            .as_ref()
            .is_some_and(|previous| previous != &self.current)
    }
}

pub struct EarningsLedger {
    engine: FareEngine,
    policy: PricingPolicy,
    history: Arc<dyn HistoryStore>,
    drivers: DashMap<DriverId, Arc<Mutex<DriverEarningsRecord>>>,
    telemetry: Arc<DispatchTelemetry>,
}

impl std::fmt::Debug for EarningsLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EarningsLedger")
            .field("drivers", &self.drivers.len())
            .finish()
    }
}

impl EarningsLedger {
    pub fn new(
        engine: FareEngine,
        policy: PricingPolicy,
        history: Arc<dyn HistoryStore>,
        telemetry: Arc<DispatchTelemetry>,
    ) -> Self {
        Self {
            engine,
            policy,
            history,
            drivers: DashMap::new(),
            telemetry,
        }
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    fn slot(&self, driver_id: &DriverId) -> Arc<Mutex<DriverEarningsRecord>> {
        let slot = self
            .drivers
            .entry(driver_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(DriverEarningsRecord::empty(driver_id.clone()))));
        Arc::clone(slot.value())
    }

    /// Adds one ride's earnings to the cached aggregate.
    pub fn credit(&self, driver_id: &DriverId, amount: Money) -> DriverEarningsRecord {
        let slot = self.slot(driver_id);
        let mut record = slot.lock();
        record.total_earnings += amount;
        record.total_rides += 1;
        record.clone()
    }

    /// Archives a completed ride and credits it under the driver's lock, so a
    /// concurrent [`recompute`](Self::recompute) sees either both or neither.
    pub fn record_completion(
        &self,
        driver_id: &DriverId,
        record: RideRecord,
    ) -> DispatchResult<DriverEarningsRecord> {
        let amount = FareSource::resolve(&record, &self.engine, &self.policy).amount();
        let slot = self.slot(driver_id);
        let mut cached = slot.lock();
        self.history.append(record)?;
        cached.total_earnings += amount;
        cached.total_rides += 1;
        Ok(cached.clone())
    }

    pub fn earnings(&self, driver_id: &DriverId) -> Option<DriverEarningsRecord> {
        let slot = self.drivers.get(driver_id).map(|slot| Arc::clone(slot.value()))?;
        let record = slot.lock().clone();
        Some(record)
    }

    /// Folds the completed history of one driver. Does not touch the cache.
    pub fn fold_history(&self, driver_id: &DriverId) -> DispatchResult<DriverEarningsRecord> {
        let mut folded = DriverEarningsRecord::empty(driver_id.clone());
        for record in self.history.find_by_driver(driver_id)? {
            if record.state != RideState::Completed {
                continue;
            }
            folded.total_earnings +=
                FareSource::resolve(&record, &self.engine, &self.policy).amount();
            folded.total_rides += 1;
        }
        Ok(folded)
    }

    /// Rebuilds the cached aggregate from history.
    pub fn recompute(&self, driver_id: &DriverId) -> DispatchResult<RecomputeOutcome> {
        let existed = self.drivers.contains_key(driver_id);
        let slot = self.slot(driver_id);
        let mut cached = slot.lock();
        let current = self.fold_history(driver_id)?;
        let outcome = RecomputeOutcome {
            previous: existed.then(|| cached.clone()),
            current: current.clone(),
        };
        if outcome.drifted() {
            warn!(
                driver_id = %driver_id,
                cached = cached.total_earnings,
                recomputed = current.total_earnings,
                "earnings cache drifted from history; correcting"
            );
            self.telemetry.ledger_drift_corrected();
        }
        *cached = current;
        Ok(outcome)
    }

    /// Rebuilds every driver that appears in completed history.
    pub fn recompute_all(&self) -> DispatchResult<Vec<RecomputeOutcome>> {
        let drivers: BTreeSet<DriverId> = self
            .history
            .find_by_status(RideState::Completed)?
            .into_iter()
            .filter_map(|record| record.driver_id)
            .collect();
        let outcomes = drivers
            .iter()
            .map(|driver_id| self.recompute(driver_id))
            .collect::<DispatchResult<Vec<_>>>()?;
        info!(
            drivers = outcomes.len(),
            drifted = outcomes.iter().filter(|o| o.drifted()).count(),
            "rebuilt earnings from history"
        );
        Ok(outcomes)
    }
}
