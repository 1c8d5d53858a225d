use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::model::{DriverId, LocationId, PartitionKey, Timestamp, VehicleType};

/// One driver waiting at a station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub driver_id: DriverId,
    pub location_id: LocationId,
    pub vehicle_type: VehicleType,
    /// 1-based; unique within the partition once repaired. Gaps are allowed.
    pub position: u32,
    /// `None` only for entries loaded from legacy presence documents.
    #[serde(default)]
    pub entry_time: Option<Timestamp>,
}

impl QueueEntry {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            location_id: self.location_id.clone(),
            vehicle_type: self.vehicle_type,
        }
    }
}

/// Head-first ordering: lowest position, then earliest entry time (missing
/// times last), then driver id so the order is total.
pub fn head_order(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    a.position
        .cmp(&b.position)
        .then_with(|| {
            a.entry_time
                .unwrap_or(Timestamp::MAX)
                .cmp(&b.entry_time.unwrap_or(Timestamp::MAX))
        })
        .then_with(|| a.driver_id.cmp(&b.driver_id))
}

/// Live entries of one `(location, vehicle type)` queue.
#[derive(Debug, Default)]
pub struct Partition {
    pub(crate) entries: Vec<QueueEntry>,
    /// Latest entry time handed out, so new arrivals stay strictly increasing.
    pub(crate) last_entry_time: Timestamp,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_position(&self) -> u32 {
        self.entries.iter().map(|e| e.position).max().unwrap_or(0)
    }

    pub(crate) fn next_entry_time(&mut self, now: Timestamp) -> Timestamp {
        let stamped = now.max(self.last_entry_time.saturating_add(1));
        self.last_entry_time = stamped;
        stamped
    }

    pub(crate) fn push(&mut self, mut entry: QueueEntry, now: Timestamp) -> QueueEntry {
        entry.position = self.max_position() + 1;
        entry.entry_time = Some(self.next_entry_time(now));
        self.entries.push(entry.clone());
        entry
    }

    pub(crate) fn remove(&mut self, driver_id: &DriverId) -> Option<QueueEntry> {
        let index = self.entries.iter().position(|e| &e.driver_id == driver_id)?;
        Some(self.entries.remove(index))
    }

    pub(crate) fn replace(&mut self, entries: Vec<QueueEntry>) -> Vec<QueueEntry> {
        let newest = entries.iter().filter_map(|e| e.entry_time).max().unwrap_or(0);
        self.last_entry_time = self.last_entry_time.max(newest);
        std::mem::replace(&mut self.entries, entries)
    }

    fn head_index(&self, skip: Option<&DriverId>) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| Some(&entry.driver_id) != skip)
            .min_by(|(_, a), (_, b)| head_order(a, b))
            .map(|(index, _)| index)
    }

    pub fn head(&self) -> Option<&QueueEntry> {
        self.head_index(None).map(|index| &self.entries[index])
    }

    /// Removes and returns the head, passing over `skip` if it is at the front.
    pub(crate) fn pop_head(&mut self, skip: Option<&DriverId>) -> Option<QueueEntry> {
        let index = self.head_index(skip)?;
        Some(self.entries.remove(index))
    }

    pub fn ordered(&self) -> Vec<QueueEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by(head_order);
        entries
    }

    pub fn get(&self, driver_id: &DriverId) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| &e.driver_id == driver_id)
    }
}
