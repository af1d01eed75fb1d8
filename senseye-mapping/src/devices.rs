//! Mobile device tracking with last-seen aging.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use senseye_common::{NodeId, Point, SignalKind};

/// A tracked device in the dynamic overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedDevice {
    /// Device identifier (MAC-like)
    pub device_id: NodeId,
    /// Display name, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Estimated position, when trilateration succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    /// Containing zone, when a floorplan exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Motion flag from the latest fused belief
    pub moving: bool,
    /// Last observation timestamp (Unix seconds)
    pub last_seen: f64,
    /// Signal kind the device was last seen on
    pub signal_kind: SignalKind,
}

/// Upsert-style device registry.
#[derive(Debug, Clone, Default)]
pub struct DeviceTracker {
    devices: BTreeMap<NodeId, TrackedDevice>,
}

impl DeviceTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts a device, keeping previous values where the update is None.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        device_id: &str,
        name: Option<String>,
        position: Option<Point>,
        zone: Option<String>,
        moving: bool,
        signal_kind: SignalKind,
        now: f64,
    ) -> &TrackedDevice {
        let entry = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| TrackedDevice {
                device_id: device_id.to_string(),
                name: None,
                position: None,
                zone: None,
                moving: false,
                last_seen: now,
                signal_kind,
            });
        if name.is_some() {
            entry.name = name;
        }
        if position.is_some() {
            entry.position = position;
        }
        if zone.is_some() {
            entry.zone = zone;
        }
        entry.moving = moving;
        entry.signal_kind = signal_kind;
        entry.last_seen = now;
        entry
    }

    /// Devices seen within `max_age` seconds.
    pub fn active(&self, now: f64, max_age: f64) -> BTreeMap<NodeId, TrackedDevice> {
        self.devices
            .iter()
            .filter(|(_, d)| now - d.last_seen <= max_age)
            .map(|(id, d)| (id.clone(), d.clone()))
            .collect()
    }

    /// Removes devices not seen within `max_age` seconds.
    pub fn cleanup(&mut self, now: f64, max_age: f64) {
        self.devices.retain(|_, d| now - d.last_seen <= max_age);
    }

    /// Looks up a device.
    pub fn get(&self, device_id: &str) -> Option<&TrackedDevice> {
        self.devices.get(device_id)
    }

    /// Number of tracked devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when no devices are tracked.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_preserves_known_fields() {
        let mut tracker = DeviceTracker::new();
        tracker.update(
            "dev",
            Some("phone".into()),
            Some(Point::new(1.0, 2.0)),
            None,
            false,
            SignalKind::Ble,
            100.0,
        );
        // A later update without a position keeps the old one.
        tracker.update("dev", None, None, Some("hall".into()), true, SignalKind::Ble, 101.0);

        let device = tracker.get("dev").unwrap();
        assert_eq!(device.name.as_deref(), Some("phone"));
        assert_eq!(device.position, Some(Point::new(1.0, 2.0)));
        assert_eq!(device.zone.as_deref(), Some("hall"));
        assert!(device.moving);
        assert_eq!(device.last_seen, 101.0);
    }

    #[test]
    fn test_active_filters_by_age() {
        let mut tracker = DeviceTracker::new();
        tracker.update("old", None, None, None, false, SignalKind::Wifi, 10.0);
        tracker.update("new", None, None, None, false, SignalKind::Wifi, 95.0);
        let active = tracker.active(100.0, 60.0);
        assert!(active.contains_key("new"));
        assert!(!active.contains_key("old"));
    }

    #[test]
    fn test_cleanup_removes_stale() {
        let mut tracker = DeviceTracker::new();
        tracker.update("old", None, None, None, false, SignalKind::Wifi, 10.0);
        tracker.cleanup(100.0, 60.0);
        assert!(tracker.is_empty());
    }
}
