//! Core data types shared across the senseye crates.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Stable node identifier (mDNS service instance name / announce id).
pub type NodeId = String;

/// Wall-clock timestamp in seconds since the Unix epoch.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// 2D position vector (meters).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// X coordinate (meters)
    pub x: f64,
    /// Y coordinate (meters)
    pub y: f64,
}

impl Point {
    /// Creates a new point.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance_to(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Vector magnitude.
    pub fn magnitude(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2})", self.x, self.y)
    }
}

/// Signal kind of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// WiFi beacon RSSI
    Wifi,
    /// BLE advertisement RSSI
    Ble,
    /// Ultrasonic acoustic ranging
    Acoustic,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Wifi => write!(f, "wifi"),
            SignalKind::Ble => write!(f, "ble"),
            SignalKind::Acoustic => write!(f, "acoustic"),
        }
    }
}

/// A single timestamped observation on one signal path.
///
/// For RF kinds `value` is an RSSI in dBm; for acoustic it is a distance in
/// meters. Measurements are immutable and consumed once by the filter bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    /// Observing node
    pub source: NodeId,
    /// Observed device or peer
    pub target: NodeId,
    /// Signal kind
    pub kind: SignalKind,
    /// Capture timestamp (Unix seconds)
    pub timestamp: f64,
    /// RSSI (dBm) or distance (m) depending on `kind`
    pub value: f64,
    /// Matched-filter peak SNR for acoustic measurements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
}

/// Unordered pair of node ids, used to key link state.
///
/// The two ids are stored in canonical (sorted) order so that `(a, b)` and
/// `(b, a)` map to the same key. Serializes as `"a|b"` so it can be used as
/// a JSON object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    a: NodeId,
    b: NodeId,
}

impl PairKey {
    /// Creates a canonical pair key from two endpoints.
    pub fn new(x: impl Into<NodeId>, y: impl Into<NodeId>) -> Self {
        let (x, y) = (x.into(), y.into());
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    /// First endpoint in canonical order.
    pub fn first(&self) -> &str {
        &self.a
    }

    /// Second endpoint in canonical order.
    pub fn second(&self) -> &str {
        &self.b
    }

    /// Returns the endpoint opposite to `id`, if `id` is part of the pair.
    pub fn other(&self, id: &str) -> Option<&str> {
        if self.a == id {
            Some(&self.b)
        } else if self.b == id {
            Some(&self.a)
        } else {
            None
        }
    }

    /// Returns true if `id` is one of the endpoints.
    pub fn contains(&self, id: &str) -> bool {
        self.a == id || self.b == id
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.a, self.b)
    }
}

impl FromStr for PairKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once('|')
            .ok_or_else(|| format!("pair key missing separator: {s}"))?;
        if a.is_empty() || b.is_empty() {
            return Err(format!("pair key has empty endpoint: {s}"));
        }
        Ok(PairKey::new(a, b))
    }
}

impl Serialize for PairKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PairKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_distance() {
        let p1 = Point::new(0.0, 0.0);
        let p2 = Point::new(3.0, 4.0);
        assert!((p1.distance_to(&p2) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_pair_key_canonical_order() {
        assert_eq!(PairKey::new("b", "a"), PairKey::new("a", "b"));
        assert_eq!(PairKey::new("b", "a").first(), "a");
    }

    #[test]
    fn test_pair_key_other() {
        let key = PairKey::new("node-1", "node-2");
        assert_eq!(key.other("node-1"), Some("node-2"));
        assert_eq!(key.other("node-2"), Some("node-1"));
        assert_eq!(key.other("node-3"), None);
    }

    #[test]
    fn test_pair_key_roundtrip() {
        let key = PairKey::new("beta", "alpha");
        let s = key.to_string();
        assert_eq!(s, "alpha|beta");
        assert_eq!(s.parse::<PairKey>().unwrap(), key);
    }

    #[test]
    fn test_pair_key_rejects_malformed() {
        assert!("no-separator".parse::<PairKey>().is_err());
        assert!("|empty".parse::<PairKey>().is_err());
    }

    #[test]
    fn test_signal_kind_serde() {
        let json = serde_json::to_string(&SignalKind::Ble).unwrap();
        assert_eq!(json, "\"ble\"");
    }
}
