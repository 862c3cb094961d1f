//! Device ledger: the system of record for every observed source address.
//!
//! [`Device`] fields are private and only change through [`Device::apply`],
//! which enforces the two ledger invariants:
//!
//! - a name, once set, is never replaced;
//! - risk only grows, by the signal's weight, on the first sighting of an
//!   activity, and never past 1.0.

use crate::monitor::types::DeviceSnapshot;
use dashmap::DashMap;
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct Device {
    name:       Option<String>,
    /// Insertion order, for presentation.
    activities: Vec<String>,
    /// Membership index over `activities`.
    seen:       HashSet<String>,
    risk:       f32,
}

/// What a single [`Device::apply`] call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Change {
    pub named:        bool,
    pub new_activity: bool,
}

impl Device {
    fn apply(&mut self, activity: &str, weight: f32, name: Option<&str>) -> Change {
        let mut change = Change::default();

        if self.name.is_none() {
            if let Some(n) = name.filter(|n| !n.is_empty()) {
                self.name = Some(n.to_string());
                change.named = true;
            }
        }

        if !self.seen.contains(activity) {
            self.seen.insert(activity.to_string());
            self.activities.push(activity.to_string());
            self.risk = (self.risk + weight.max(0.0)).min(1.0);
            change.new_activity = true;
        }

        change
    }

    pub fn risk(&self) -> f32 {
        self.risk
    }

    fn snapshot(&self, address: &str) -> DeviceSnapshot {
        DeviceSnapshot {
            address:    address.to_string(),
            name:       self.name.clone(),
            activities: self.activities.clone(),
            risk:       self.risk,
        }
    }
}

/// Result of [`Ledger::record`].
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    /// Copy of the device, taken only when something visible changed.
    pub snapshot: Option<DeviceSnapshot>,
    pub risk:     f32,
    pub created:  bool,
    pub change:   Change,
}

impl Recorded {
    /// Whether anything visible about the device changed.
    pub fn is_update(&self) -> bool {
        self.snapshot.is_some()
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    devices: DashMap<String, Device>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one accepted signal to the device at `address`, creating it on
    /// first sight.
    pub fn record(&self, address: &str, activity: &str, weight: f32, name: Option<&str>) -> Recorded {
        let mut created = false;
        let mut device = self
            .devices
            .entry(address.to_string())
            .or_insert_with(|| {
                created = true;
                Device::default()
            });

        let change  = device.apply(activity, weight, name);
        let visible = created || change.named || change.new_activity;
        Recorded {
            snapshot: visible.then(|| device.snapshot(address)),
            risk:     device.risk,
            created,
            change,
        }
    }

    pub fn get(&self, address: &str) -> Option<DeviceSnapshot> {
        self.devices.get(address).map(|d| d.snapshot(address))
    }

    /// All devices, ordered by address.
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<DeviceSnapshot> = self
            .devices
            .iter()
            .map(|e| e.value().snapshot(e.key()))
            .collect();
        all.sort_by(|a, b| a.address.cmp(&b.address));
        all
    }

    /// Current risk of every device.
    pub fn risks(&self) -> Vec<f32> {
        self.devices.iter().map(|e| e.value().risk()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Forgets every device. Only used on a full session reset.
    pub fn clear(&self) {
        self.devices.clear();
    }
}
