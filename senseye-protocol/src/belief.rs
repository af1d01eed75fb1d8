//! Belief data model: one node's view of links, devices and zones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use senseye_common::{NodeId, PairKey};

/// Fused or locally-inferred state of one signal link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkBelief {
    /// Excess attenuation over the free-space expectation (dB, >= 0)
    pub attenuation_db: f64,
    /// Probability that something is moving across this link
    pub motion_prob: f64,
    /// Confidence in this link state, in (0, 1)
    pub confidence: f64,
}

/// Tracked state of an observed device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBelief {
    /// Filtered RSSI (dBm)
    pub rssi_dbm: f64,
    /// Estimated distance from the reporting node (m, > 0)
    pub distance_m: f64,
    /// Whether the device (or the path to it) shows motion
    pub moving: bool,
    /// Confidence in this device state, in (0, 1)
    pub confidence: f64,
}

/// Aggregated occupancy/motion state of a zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneBelief {
    /// Probability the zone is occupied
    pub occupied_prob: f64,
    /// Probability of motion within the zone
    pub motion_prob: f64,
}

/// One node's emitted belief: links, devices and zones with confidences.
///
/// `sequence` is strictly increasing per origin; `hop_count` bounds how far
/// the belief may be relayed. A belief older than the staleness horizon is
/// excluded from fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Belief {
    /// Originating node
    pub node_id: NodeId,
    /// Emission wall-clock timestamp (Unix seconds)
    pub timestamp: f64,
    /// Monotone per-origin sequence number
    pub sequence_number: u64,
    /// Remaining relay hops
    pub hop_count: u8,
    /// Link states keyed by the unordered endpoint pair
    #[serde(default)]
    pub links: BTreeMap<PairKey, LinkBelief>,
    /// Device states keyed by device id
    #[serde(default)]
    pub devices: BTreeMap<NodeId, DeviceBelief>,
    /// Zone states keyed by zone id
    #[serde(default)]
    pub zones: BTreeMap<String, ZoneBelief>,
    /// Acoustic range estimates to peers (meters)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub acoustic_ranges: BTreeMap<NodeId, f64>,
}

impl Belief {
    /// Creates an empty belief for `node_id` at `timestamp`.
    pub fn new(node_id: impl Into<NodeId>, timestamp: f64, sequence_number: u64) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp,
            sequence_number,
            hop_count: 3,
            links: BTreeMap::new(),
            devices: BTreeMap::new(),
            zones: BTreeMap::new(),
            acoustic_ranges: BTreeMap::new(),
        }
    }

    /// True if the belief is older than `horizon_s` relative to `now`.
    pub fn is_stale(&self, now: f64, horizon_s: f64) -> bool {
        now - self.timestamp > horizon_s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_belief() -> Belief {
        let mut belief = Belief::new("node-a", 1000.0, 7);
        belief.hop_count = 2;
        belief.links.insert(
            PairKey::new("node-a", "node-b"),
            LinkBelief {
                attenuation_db: 4.5,
                motion_prob: 0.25,
                confidence: 0.8,
            },
        );
        belief.devices.insert(
            "aa:bb:cc:dd:ee:ff".into(),
            DeviceBelief {
                rssi_dbm: -61.0,
                distance_m: 4.4,
                moving: true,
                confidence: 0.6,
            },
        );
        belief.zones.insert(
            "room_0".into(),
            ZoneBelief {
                occupied_prob: 0.4,
                motion_prob: 0.9,
            },
        );
        belief.acoustic_ranges.insert("node-b".into(), 3.2);
        belief
    }

    #[test]
    fn test_json_roundtrip_is_identity() {
        let belief = sample_belief();
        let json = serde_json::to_string(&belief).unwrap();
        let back: Belief = serde_json::from_str(&json).unwrap();
        assert_eq!(back, belief);
    }

    #[test]
    fn test_missing_maps_default_empty() {
        let json = r#"{"node_id":"x","timestamp":1.0,"sequence_number":0,"hop_count":3}"#;
        let belief: Belief = serde_json::from_str(json).unwrap();
        assert!(belief.links.is_empty());
        assert!(belief.devices.is_empty());
        assert!(belief.zones.is_empty());
        assert!(belief.acoustic_ranges.is_empty());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        // Compatibility is additive-only: newer peers may send extra fields.
        let json = r#"{"node_id":"x","timestamp":1.0,"sequence_number":0,
                       "hop_count":3,"some_future_field":42}"#;
        assert!(serde_json::from_str::<Belief>(json).is_ok());
    }

    #[test]
    fn test_staleness() {
        let belief = Belief::new("x", 100.0, 0);
        assert!(!belief.is_stale(105.0, 10.0));
        assert!(belief.is_stale(120.0, 10.0));
    }
}
