//! Queue integrity: detection and deterministic repair.
//!
//! Critical issues (duplicate positions, missing entry times) are repaired in
//! place. Gaps are minor and are never renumbered: they close on their own as
//! the head is dequeued and new arrivals append after the current maximum.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::partition::Partition;
use crate::model::{DriverId, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    DuplicatePosition { position: u32, drivers: Vec<DriverId> },
    MissingEntryTime { driver_id: DriverId, position: u32 },
    Gap { after: u32, before: u32 },
}

impl IntegrityIssue {
    pub fn is_critical(&self) -> bool {
        !matches!(self, IntegrityIssue::Gap { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub critical: Vec<IntegrityIssue>,
    pub minor: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn needs_repair(&self) -> bool {
        !self.critical.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.critical.is_empty() && self.minor.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reassignment {
    pub driver_id: DriverId,
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairOutcome {
    /// Drivers whose missing entry time was stamped.
    pub stamped: Vec<DriverId>,
    pub reassigned: Vec<Reassignment>,
}

impl RepairOutcome {
    pub fn is_noop(&self) -> bool {
        self.stamped.is_empty() && self.reassigned.is_empty()
    }

    pub fn touched(&self) -> usize {
        self.stamped.len() + self.reassigned.len()
    }
}

impl Partition {
    pub fn inspect(&self) -> IntegrityReport {
        let mut report = IntegrityReport::default();

        let mut by_position: BTreeMap<u32, Vec<DriverId>> = BTreeMap::new();
        for entry in &self.entries {
            by_position
                .entry(entry.position)
                .or_default()
                .push(entry.driver_id.clone());
            if entry.entry_time.is_none() {
                report.critical.push(IntegrityIssue::MissingEntryTime {
                    driver_id: entry.driver_id.clone(),
                    position: entry.position,
                });
            }
        }

        let mut previous: Option<u32> = None;
        for (position, mut drivers) in by_position {
            if drivers.len() > 1 {
                drivers.sort();
                report
                    .critical
                    .push(IntegrityIssue::DuplicatePosition { position, drivers });
            }
            if let Some(prev) = previous {
                if position > prev + 1 {
                    report.minor.push(IntegrityIssue::Gap {
                        after: prev,
                        before: position,
                    });
                }
            }
            previous = Some(position);
        }

        report
    }

    /// Stamps missing entry times, then moves every duplicate but the earliest
    /// to fresh positions after the current maximum, in entry-time order.
    /// Running it again on the result changes nothing.
    pub fn repair(&mut self, now: Timestamp) -> RepairOutcome {
        let mut outcome = RepairOutcome::default();

        let mut untimed: Vec<usize> = (0..self.entries.len())
            .filter(|&i| self.entries[i].entry_time.is_none())
            .collect();
        untimed.sort_by(|&a, &b| {
            let (a, b) = (&self.entries[a], &self.entries[b]);
            a.position
                .cmp(&b.position)
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        });
        for index in untimed {
            let stamped = self.next_entry_time(now);
            let entry = &mut self.entries[index];
            entry.entry_time = Some(stamped);
            outcome.stamped.push(entry.driver_id.clone());
        }

        let sort_key = |partition: &Partition, index: usize| {
            let entry = &partition.entries[index];
            (entry.entry_time.unwrap_or(Timestamp::MAX), entry.driver_id.clone())
        };

        let mut by_position: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (index, entry) in self.entries.iter().enumerate() {
            by_position.entry(entry.position).or_default().push(index);
        }

        let mut displaced = Vec::new();
        for (_, mut indices) in by_position {
            if indices.len() < 2 {
                continue;
            }
            indices.sort_by_key(|&i| sort_key(self, i));
            displaced.extend(indices.into_iter().skip(1));
        }
        displaced.sort_by_key(|&i| sort_key(self, i));

        let mut next_position = self.max_position();
        for index in displaced {
            next_position += 1;
            let entry = &mut self.entries[index];
            outcome.reassigned.push(Reassignment {
                driver_id: entry.driver_id.clone(),
                from: entry.position,
                to: next_position,
            });
            entry.position = next_position;
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LocationId, VehicleType};
    use crate::queue::QueueEntry;

    fn entry(driver: &str, position: u32, entry_time: Option<Timestamp>) -> QueueEntry {
        QueueEntry {
            driver_id: DriverId::new(driver),
            location_id: LocationId::new("station"),
            vehicle_type: VehicleType::Cab,
            position,
            entry_time,
        }
    }

    fn partition(entries: Vec<QueueEntry>) -> Partition {
        let mut partition = Partition::default();
        partition.replace(entries);
        partition
    }

    #[test]
    fn earliest_duplicate_keeps_position() {
        let mut queue = partition(vec![
            entry("t2", 1, Some(200)),
            entry("t1", 1, Some(100)),
            entry("other", 2, Some(150)),
        ]);

        let report = queue.inspect();
        assert_eq!(
            report.critical,
            vec![IntegrityIssue::DuplicatePosition {
                position: 1,
                drivers: vec![DriverId::new("t1"), DriverId::new("t2")],
            }]
        );

        let outcome = queue.repair(1_000);
        assert_eq!(
            outcome.reassigned,
            vec![Reassignment {
                driver_id: DriverId::new("t2"),
                from: 1,
                to: 3,
            }]
        );
        assert_eq!(queue.get(&DriverId::new("t1")).unwrap().position, 1);
        assert!(!queue.inspect().needs_repair());
    }

    #[test]
    fn displaced_entries_follow_entry_time_across_groups() {
        let mut queue = partition(vec![
            entry("a", 1, Some(10)),
            entry("b", 1, Some(40)),
            entry("c", 2, Some(20)),
            entry("d", 2, Some(30)),
            entry("e", 5, Some(50)),
        ]);

        let outcome = queue.repair(1_000);
        let moved: Vec<_> = outcome
            .reassigned
            .iter()
            .map(|r| (r.driver_id.as_str(), r.to))
            .collect();
        assert_eq!(moved, vec![("d", 6), ("b", 7)]);
    }

    #[test]
    fn missing_entry_time_is_stamped_and_loses_ties() {
        let mut queue = partition(vec![
            entry("legacy", 3, None),
            entry("timed", 3, Some(500)),
        ]);
        let report = queue.inspect();
        assert_eq!(report.critical.len(), 2);

        let outcome = queue.repair(400);
        assert_eq!(outcome.stamped, vec![DriverId::new("legacy")]);
        let legacy = queue.get(&DriverId::new("legacy")).unwrap();
        assert_eq!(legacy.entry_time, Some(501));
        assert_eq!(legacy.position, 4);
        assert_eq!(queue.get(&DriverId::new("timed")).unwrap().position, 3);
    }

    #[test]
    fn repair_is_idempotent() {
        let mut queue = partition(vec![
            entry("a", 2, Some(1)),
            entry("b", 2, Some(2)),
            entry("c", 2, None),
            entry("d", 9, Some(3)),
        ]);
        let first = queue.repair(10);
        assert!(!first.is_noop());
        let snapshot = queue.ordered();

        let second = queue.repair(20);
        assert!(second.is_noop());
        assert_eq!(queue.ordered(), snapshot);
    }

    #[test]
    fn gaps_are_minor_and_left_alone() {
        let mut queue = partition(vec![
            entry("a", 1, Some(1)),
            entry("b", 3, Some(2)),
            entry("c", 4, Some(3)),
        ]);
        let report = queue.inspect();
        assert!(!report.needs_repair());
        assert_eq!(report.minor, vec![IntegrityIssue::Gap { after: 1, before: 3 }]);

        assert!(queue.repair(10).is_noop());
        assert_eq!(queue.get(&DriverId::new("b")).unwrap().position, 3);
    }
}
