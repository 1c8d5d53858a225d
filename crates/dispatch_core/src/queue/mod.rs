//! Per-station FIFO driver queues.
//!
//! Each `(location, vehicle type)` partition sits behind its own mutex; there
//! is no lock spanning partitions. The driver index maps every queued driver
//! to its partition and doubles as the uniqueness reservation: a driver holds
//! at most one live entry anywhere.
//!
//! Lock order is partition, then driver-index shard. Code that touches the
//! index first (enqueue, dequeue) releases the shard before locking a
//! partition. An index record is only removed together with its entry, under
//! the partition lock.

mod integrity;
mod partition;

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{DispatchError, DispatchResult};
use crate::model::{DriverId, LocationId, PartitionKey, VehicleType};
use crate::telemetry::DispatchTelemetry;

pub use integrity::{IntegrityIssue, IntegrityReport, Reassignment, RepairOutcome};
pub use partition::{head_order, Partition, QueueEntry};

/// Highest position accepted from the presence store. New arrivals and
/// repairs append after the maximum, so loaded positions leave headroom.
pub const MAX_LOADED_POSITION: u32 = u32::MAX / 2;

pub struct QueueManager {
    clock: Arc<dyn Clock>,
    partitions: DashMap<PartitionKey, Arc<Mutex<Partition>>>,
    drivers: DashMap<DriverId, PartitionKey>,
    telemetry: Arc<DispatchTelemetry>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("partitions", &self.partitions.len())
            .field("queued_drivers", &self.drivers.len())
            .finish()
    }
}

impl QueueManager {
    pub fn new(clock: Arc<dyn Clock>, telemetry: Arc<DispatchTelemetry>) -> Self {
        Self {
            clock,
            partitions: DashMap::new(),
            drivers: DashMap::new(),
            telemetry,
        }
    }

    fn partition(&self, key: &PartitionKey) -> Arc<Mutex<Partition>> {
        Arc::clone(self.partitions.entry(key.clone()).or_default().value())
    }

    /// Appends the driver after the partition's current maximum position.
    pub fn enqueue(
        &self,
        driver_id: &DriverId,
        location_id: &LocationId,
        vehicle_type: VehicleType,
    ) -> DispatchResult<QueueEntry> {
        let key = PartitionKey {
            location_id: location_id.clone(),
            vehicle_type,
        };
        match self.drivers.entry(driver_id.clone()) {
            Entry::Occupied(occupied) => {
                return Err(DispatchError::AlreadyQueued {
                    driver_id: driver_id.clone(),
                    partition: occupied.get().clone(),
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(key.clone());
            }
        }

        let partition = self.partition(&key);
        let mut queue = partition.lock();
        // A partition reload may have claimed the driver before we got the lock.
        let reserved = self
            .drivers
            .get(driver_id)
            .is_some_and(|reserved| *reserved == key);
        if !reserved {
            return Err(DispatchError::NotQueued(driver_id.clone()));
        }
        // A reload may already have placed the driver here.
        if queue.get(driver_id).is_some() {
            return Err(DispatchError::AlreadyQueued {
                driver_id: driver_id.clone(),
                partition: key,
            });
        }
        let entry = queue.push(
            QueueEntry {
                driver_id: driver_id.clone(),
                location_id: location_id.clone(),
                vehicle_type,
                position: 0,
                entry_time: None,
            },
            self.clock.now_ms(),
        );
        debug!(driver_id = %driver_id, partition = %key, position = entry.position, "driver queued");
        Ok(entry)
    }

    /// Removes the driver's entry. Remaining positions are not renumbered.
    ///
    /// The entry and its index reservation are dropped together under the
    /// partition lock, so a concurrent enqueue never sees one without the other.
    pub fn dequeue(&self, driver_id: &DriverId) -> DispatchResult<QueueEntry> {
        let key = self
            .drivers
            .get(driver_id)
            .map(|reserved| reserved.value().clone())
            .ok_or_else(|| DispatchError::NotQueued(driver_id.clone()))?;
        let partition = self.partition(&key);
        let mut queue = partition.lock();
        let entry = queue
            .remove(driver_id)
            .ok_or_else(|| DispatchError::NotQueued(driver_id.clone()))?;
        self.drivers
            .remove_if(driver_id, |_, reserved| *reserved == key);
        debug!(driver_id = %driver_id, partition = %key, position = entry.position, "driver left queue");
        Ok(entry)
    }

    pub fn peek_head(
        &self,
        location_id: &LocationId,
        vehicle_type: VehicleType,
    ) -> Option<DriverId> {
        let key = PartitionKey {
            location_id: location_id.clone(),
            vehicle_type,
        };
        let partition = Arc::clone(self.partitions.get(&key)?.value());
        let queue = partition.lock();
        queue.head().map(|entry| entry.driver_id.clone())
    }

    /// Atomically takes the head of the partition for a match, passing over
    /// `skip` (a driver who just declined or timed out on this ride).
    pub fn claim_head(&self, key: &PartitionKey, skip: Option<&DriverId>) -> Option<QueueEntry> {
        let partition = Arc::clone(self.partitions.get(key)?.value());
        let mut queue = partition.lock();
        let entry = queue.pop_head(skip)?;
        self.drivers.remove_if(&entry.driver_id, |_, reserved| reserved == key);
        Some(entry)
    }

    pub fn validate_integrity(
        &self,
        location_id: &LocationId,
        vehicle_type: VehicleType,
    ) -> IntegrityReport {
        let key = PartitionKey {
            location_id: location_id.clone(),
            vehicle_type,
        };
        match self.partitions.get(&key).map(|p| Arc::clone(p.value())) {
            Some(partition) => partition.lock().inspect(),
            None => IntegrityReport::default(),
        }
    }

    /// Repairs critical issues in place. Idempotent.
    pub fn repair(&self, key: &PartitionKey) -> RepairOutcome {
        let Some(partition) = self.partitions.get(key).map(|p| Arc::clone(p.value())) else {
            return RepairOutcome::default();
        };
        let outcome = partition.lock().repair(self.clock.now_ms());
        if !outcome.is_noop() {
            for moved in &outcome.reassigned {
                warn!(
                    partition = %key,
                    driver_id = %moved.driver_id,
                    from = moved.from,
                    to = moved.to,
                    "duplicate queue position reassigned"
                );
            }
            if !outcome.stamped.is_empty() {
                warn!(partition = %key, count = outcome.stamped.len(), "stamped queue entries missing entry time");
            }
            self.telemetry.queue_repaired(outcome.touched());
        }
        outcome
    }

    /// Validates and, only if something critical is found, repairs.
    pub fn ensure_integrity(&self, key: &PartitionKey) -> RepairOutcome {
        let report = self.validate_integrity(&key.location_id, key.vehicle_type);
        if !report.minor.is_empty() {
            debug!(partition = %key, gaps = report.minor.len(), "queue has position gaps");
        }
        if report.needs_repair() {
            self.repair(key)
        } else {
            RepairOutcome::default()
        }
    }

    /// Replaces a partition with entries loaded from the driver-presence store.
    ///
    /// Loaded entries may carry duplicate positions or lack entry times; they
    /// are kept as-is and left to [`repair`](Self::repair). Positions outside
    /// `1..=MAX_LOADED_POSITION` and drivers listed twice reject the whole load.
    pub fn load_partition(
        &self,
        key: &PartitionKey,
        entries: Vec<QueueEntry>,
    ) -> DispatchResult<()> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            let reason = if entry.position == 0 {
                Some("position must be at least 1")
            } else if entry.position > MAX_LOADED_POSITION {
                Some("position out of range")
            } else if !seen.insert(&entry.driver_id) {
                Some("driver listed more than once")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(DispatchError::InvalidQueueEntry {
                    driver_id: entry.driver_id.clone(),
                    reason,
                });
            }
        }

        let partition = self.partition(key);
        let mut queue = partition.lock();
        for entry in &entries {
            if let Some(existing) = self.drivers.get(&entry.driver_id) {
                if *existing != *key {
                    return Err(DispatchError::AlreadyQueued {
                        driver_id: entry.driver_id.clone(),
                        partition: existing.clone(),
                    });
                }
            }
        }
        let entries = entries
            .into_iter()
            .map(|mut entry| {
                entry.location_id = key.location_id.clone();
                entry.vehicle_type = key.vehicle_type;
                entry
            })
            .collect::<Vec<_>>();
        for previous in queue.replace(entries) {
            self.drivers.remove_if(&previous.driver_id, |_, reserved| reserved == key);
        }
        for entry in &queue.entries {
            self.drivers.insert(entry.driver_id.clone(), key.clone());
        }
        debug!(partition = %key, entries = queue.len(), "queue partition loaded");
        Ok(())
    }

    /// Entries in head-first order.
    pub fn snapshot(&self, key: &PartitionKey) -> Vec<QueueEntry> {
        self.partitions
            .get(key)
            .map(|p| Arc::clone(p.value()))
            .map(|partition| partition.lock().ordered())
            .unwrap_or_default()
    }

    pub fn entry_of(&self, driver_id: &DriverId) -> Option<QueueEntry> {
        let key = self.drivers.get(driver_id)?.value().clone();
        let partition = Arc::clone(self.partitions.get(&key)?.value());
        let queue = partition.lock();
        queue.get(driver_id).cloned()
    }

    pub fn is_queued(&self, driver_id: &DriverId) -> bool {
        self.drivers.contains_key(driver_id)
    }

    pub fn len(&self, key: &PartitionKey) -> usize {
        self.partitions
            .get(key)
            .map(|p| Arc::clone(p.value()))
            .map(|partition| partition.lock().len())
            .unwrap_or(0)
    }
}
