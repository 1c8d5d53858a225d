//! Append-only ride history.
//!
//! The production backing is a document store reachable through simple
//! find/append calls; [`InMemoryHistoryStore`] is the reference implementation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{CustomerId, DriverId, Money, RideId, Timestamp, VehicleType};
use crate::ride::RideState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("history store unavailable: {0}")]
    Unavailable(String),
    #[error("ride {0} is already archived")]
    Duplicate(RideId),
}

/// One archived ride as stored in history.
///
/// Older documents predate `driver_fare` (and sometimes `distance_km`); those
/// fields are optional so legacy rows load unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRecord {
    pub ride_id: RideId,
    pub driver_id: Option<DriverId>,
    pub customer_id: CustomerId,
    pub vehicle_type: VehicleType,
    pub state: RideState,
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default)]
    pub driver_fare: Option<Money>,
    #[serde(default)]
    pub customer_fare: Option<Money>,
    /// Single `fare` field written before the driver/customer split existed.
    #[serde(default)]
    pub legacy_fare: Option<Money>,
    /// Customer-facing estimate shown at request time.
    #[serde(default)]
    pub estimated_fare: Option<Money>,
    pub finished_at: Timestamp,
}

pub trait HistoryStore: Send + Sync {
    fn append(&self, record: RideRecord) -> Result<(), StoreError>;

    fn find_by_driver(&self, driver_id: &DriverId) -> Result<Vec<RideRecord>, StoreError>;

    fn find_by_status(&self, state: RideState) -> Result<Vec<RideRecord>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    records: RwLock<Vec<RideRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with existing (possibly legacy) documents.
    pub fn with_records(records: Vec<RideRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn find_by_ride(&self, ride_id: &RideId) -> Option<RideRecord> {
        self.records
            .read()
            .iter()
            .find(|record| &record.ride_id == ride_id)
            .cloned()
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn append(&self, record: RideRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.iter().any(|r| r.ride_id == record.ride_id) {
            return Err(StoreError::Duplicate(record.ride_id));
        }
        records.push(record);
        Ok(())
    }

    fn find_by_driver(&self, driver_id: &DriverId) -> Result<Vec<RideRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|record| record.driver_id.as_ref() == Some(driver_id))
            .cloned()
            .collect())
    }

    fn find_by_status(&self, state: RideState) -> Result<Vec<RideRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|record| record.state == state)
            .cloned()
            .collect())
    }
}
