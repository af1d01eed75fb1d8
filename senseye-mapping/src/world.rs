//! Combined world state: static map + dynamic overlay + health.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use senseye_common::{NodeId, Point, SignalKind, WorldConfig};
use senseye_protocol::Belief;

use crate::devices::{DeviceTracker, TrackedDevice};
use crate::floorplan::FloorPlan;
use crate::motion::MotionState;

/// Health of a participating node as seen from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Node id
    pub node_id: NodeId,
    /// Whether a belief arrived within the offline horizon
    pub online: bool,
    /// Timestamp of the last received belief
    pub last_seen: f64,
}

/// Calibration status surfaced to renderers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStatus {
    /// No floorplan has been built yet
    #[default]
    None,
    /// A calibration run is in progress
    Running,
    /// The current floorplan is in use
    Ready,
    /// The last calibration attempt failed
    Failed,
}

/// Mutable world state owned by the pipeline task.
#[derive(Debug, Default)]
pub struct WorldState {
    /// Static map, when calibrated
    pub floorplan: Option<FloorPlan>,
    /// Decayed motion overlay
    pub motion: MotionState,
    /// Tracked devices
    pub devices: DeviceTracker,
    /// Per-node health
    pub nodes: BTreeMap<NodeId, NodeHealth>,
    /// Latest runtime tomography overlay
    pub live_attenuation: Option<crate::floorplan::WallGrid>,
    /// Current calibration status
    pub calibration_status: CalibrationStatus,
    /// Last update timestamp
    pub timestamp: f64,
}

/// Immutable per-cycle snapshot consumed by renderers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldSnapshot {
    /// Static map copy
    pub floorplan: Option<FloorPlan>,
    /// Zone motion intensities
    pub zone_motion: BTreeMap<String, f64>,
    /// Active devices
    pub devices: BTreeMap<NodeId, TrackedDevice>,
    /// Node health entries
    pub nodes: Vec<NodeHealth>,
    /// Latest runtime tomography overlay
    pub live_attenuation: Option<crate::floorplan::WallGrid>,
    /// Seconds since calibration (0 when no floorplan)
    pub map_age: f64,
    /// Calibration status
    pub calibration_status: CalibrationStatus,
    /// Snapshot timestamp
    pub timestamp: f64,
}

/// Updates the dynamic layer from one fused belief.
///
/// Refreshes zone motion, upserts devices (with positions where the fusion
/// produced them), marks reporting nodes online and ages out silent ones.
pub fn update_world(
    state: &mut WorldState,
    fused: &Belief,
    dt: f64,
    device_positions: &BTreeMap<NodeId, Point>,
    online_nodes: &BTreeSet<NodeId>,
    config: &WorldConfig,
    now: f64,
) {
    state.motion.update(&fused.zones, dt, config.motion_decay, now);

    for (device_id, device) in &fused.devices {
        let position = device_positions.get(device_id).copied();
        let zone = position.and_then(|p| {
            state
                .floorplan
                .as_ref()
                .and_then(|plan| plan.rooms.nearest_room(p))
                .map(|room| room.name.clone())
        });
        let name = state
            .floorplan
            .as_ref()
            .and_then(|plan| plan.labels.get(device_id).cloned());
        state.devices.update(
            device_id,
            name,
            position,
            zone,
            device.moving,
            SignalKind::Ble,
            now,
        );
    }

    for node_id in online_nodes {
        state
            .nodes
            .entry(node_id.clone())
            .and_modify(|health| {
                health.online = true;
                health.last_seen = now;
            })
            .or_insert_with(|| NodeHealth {
                node_id: node_id.clone(),
                online: true,
                last_seen: now,
            });
    }
    for health in state.nodes.values_mut() {
        if now - health.last_seen > config.node_offline_s {
            health.online = false;
        }
    }

    state.timestamp = now;
}

impl WorldState {
    /// Produces the immutable snapshot for this cycle.
    pub fn snapshot(&self, now: f64, device_max_age: f64) -> WorldSnapshot {
        WorldSnapshot {
            floorplan: self.floorplan.clone(),
            zone_motion: self.motion.zone_motion.clone(),
            devices: self.devices.active(now, device_max_age),
            nodes: self.nodes.values().cloned().collect(),
            live_attenuation: self.live_attenuation.clone(),
            map_age: self
                .floorplan
                .as_ref()
                .map(|plan| plan.age(now))
                .unwrap_or(0.0),
            calibration_status: self.calibration_status,
            timestamp: now,
        }
    }
}

/// Decides when the node should recalibrate its floorplan.
#[derive(Debug, Clone)]
pub struct RecalibrationPolicy {
    /// Peer set at the time of the last calibration
    pub calibrated_peers: BTreeSet<NodeId>,
    /// Timestamp of the last acoustic round
    pub last_acoustic: f64,
}

impl RecalibrationPolicy {
    /// Creates a policy snapshotting the current peer set.
    pub fn new(peers: BTreeSet<NodeId>, now: f64) -> Self {
        Self {
            calibrated_peers: peers,
            last_acoustic: now,
        }
    }

    /// True when any trigger fires: no floorplan, peer membership changed,
    /// the scheduled acoustic interval elapsed, or mean RSSI drift from the
    /// calibration baseline exceeds the threshold over enough devices.
    pub fn should_recalibrate(
        &self,
        floorplan: Option<&FloorPlan>,
        current_peers: &BTreeSet<NodeId>,
        current_rssi: &BTreeMap<NodeId, f64>,
        acoustic_interval: Option<f64>,
        config: &WorldConfig,
        now: f64,
    ) -> bool {
        let Some(plan) = floorplan else {
            return true;
        };

        if *current_peers != self.calibrated_peers {
            return true;
        }

        if let Some(interval) = acoustic_interval {
            if now - self.last_acoustic >= interval {
                return true;
            }
        }

        // Mean absolute drift over devices common to the baseline.
        let mut drift_sum = 0.0;
        let mut common = 0usize;
        for (device_id, &baseline) in &plan.baseline_rssi {
            if let Some(&current) = current_rssi.get(device_id) {
                drift_sum += (current - baseline).abs();
                common += 1;
            }
        }
        common >= config.drift_min_devices
            && drift_sum / common as f64 > config.drift_threshold_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use senseye_protocol::{DeviceBelief, ZoneBelief};

    fn world_config() -> WorldConfig {
        WorldConfig::default()
    }

    fn plan_with_baseline(baseline: &[(&str, f64)]) -> FloorPlan {
        FloorPlan {
            node_positions: BTreeMap::new(),
            walls: vec![],
            rooms: Default::default(),
            bounds: (0.0, 0.0, 1.0, 1.0),
            labels: BTreeMap::new(),
            wall_grid: None,
            baseline_rssi: baseline
                .iter()
                .map(|(id, rssi)| (id.to_string(), *rssi))
                .collect(),
            built_at: 1000.0,
        }
    }

    fn fused_belief() -> Belief {
        let mut belief = Belief::new("local", 100.0, 1);
        belief.zones.insert(
            "room_0".into(),
            ZoneBelief {
                occupied_prob: 0.6,
                motion_prob: 0.7,
            },
        );
        belief.devices.insert(
            "dev".into(),
            DeviceBelief {
                rssi_dbm: -55.0,
                distance_m: 3.0,
                moving: true,
                confidence: 0.8,
            },
        );
        belief
    }

    #[test]
    fn test_update_world_refreshes_overlay() {
        let mut state = WorldState::default();
        let online = BTreeSet::from(["peer".to_string()]);
        update_world(
            &mut state,
            &fused_belief(),
            1.0,
            &BTreeMap::new(),
            &online,
            &world_config(),
            100.0,
        );
        assert!((state.motion.intensity("room_0") - 0.7).abs() < 1e-12);
        assert!(state.devices.get("dev").unwrap().moving);
        assert!(state.nodes["peer"].online);
    }

    #[test]
    fn test_silent_nodes_go_offline() {
        let mut state = WorldState::default();
        let online = BTreeSet::from(["peer".to_string()]);
        let config = world_config();
        update_world(
            &mut state,
            &fused_belief(),
            1.0,
            &BTreeMap::new(),
            &online,
            &config,
            100.0,
        );
        update_world(
            &mut state,
            &fused_belief(),
            30.0,
            &BTreeMap::new(),
            &BTreeSet::new(),
            &config,
            130.0,
        );
        assert!(!state.nodes["peer"].online);
    }

    #[test]
    fn test_snapshot_reports_map_age() {
        let mut state = WorldState {
            floorplan: Some(plan_with_baseline(&[])),
            ..Default::default()
        };
        state.calibration_status = CalibrationStatus::Ready;
        let snapshot = state.snapshot(1300.0, 60.0);
        assert!((snapshot.map_age - 300.0).abs() < 1e-9);
        assert_eq!(snapshot.calibration_status, CalibrationStatus::Ready);
    }

    #[test]
    fn test_recalibrate_without_floorplan() {
        let policy = RecalibrationPolicy::new(BTreeSet::new(), 0.0);
        assert!(policy.should_recalibrate(
            None,
            &BTreeSet::new(),
            &BTreeMap::new(),
            None,
            &world_config(),
            10.0,
        ));
    }

    #[test]
    fn test_recalibrate_on_peer_change() {
        let plan = plan_with_baseline(&[]);
        let policy = RecalibrationPolicy::new(BTreeSet::from(["a".to_string()]), 0.0);
        let changed = BTreeSet::from(["a".to_string(), "b".to_string()]);
        assert!(policy.should_recalibrate(
            Some(&plan),
            &changed,
            &BTreeMap::new(),
            None,
            &world_config(),
            10.0,
        ));
        let same = BTreeSet::from(["a".to_string()]);
        assert!(!policy.should_recalibrate(
            Some(&plan),
            &same,
            &BTreeMap::new(),
            None,
            &world_config(),
            10.0,
        ));
    }

    #[test]
    fn test_recalibrate_on_acoustic_interval() {
        let plan = plan_with_baseline(&[]);
        let policy = RecalibrationPolicy::new(BTreeSet::new(), 0.0);
        assert!(policy.should_recalibrate(
            Some(&plan),
            &BTreeSet::new(),
            &BTreeMap::new(),
            Some(600.0),
            &world_config(),
            601.0,
        ));
        assert!(!policy.should_recalibrate(
            Some(&plan),
            &BTreeSet::new(),
            &BTreeMap::new(),
            Some(600.0),
            &world_config(),
            599.0,
        ));
    }

    #[test]
    fn test_recalibrate_on_rssi_drift() {
        let plan = plan_with_baseline(&[("a", -50.0), ("b", -60.0), ("c", -70.0)]);
        let policy = RecalibrationPolicy::new(BTreeSet::new(), 0.0);
        let config = world_config();

        // Large drift over all three common devices.
        let drifted: BTreeMap<NodeId, f64> = [("a", -62.0), ("b", -72.0), ("c", -82.0)]
            .iter()
            .map(|(id, rssi)| (id.to_string(), *rssi))
            .collect();
        assert!(policy.should_recalibrate(Some(&plan), &BTreeSet::new(), &drifted, None, &config, 1.0));

        // Same drift but only two common devices: below the minimum count.
        let two: BTreeMap<NodeId, f64> = [("a", -62.0), ("b", -72.0)]
            .iter()
            .map(|(id, rssi)| (id.to_string(), *rssi))
            .collect();
        assert!(!policy.should_recalibrate(Some(&plan), &BTreeSet::new(), &two, None, &config, 1.0));

        // Small drift: stays calibrated.
        let steady: BTreeMap<NodeId, f64> = [("a", -51.0), ("b", -61.0), ("c", -69.0)]
            .iter()
            .map(|(id, rssi)| (id.to_string(), *rssi))
            .collect();
        assert!(!policy.should_recalibrate(Some(&plan), &BTreeSet::new(), &steady, None, &config, 1.0));
    }
}
