//! Calibration orchestrator: observations → static floorplan.
//!
//! Fuses RF and acoustic distance estimates (acoustic preferred), lays
//! out nodes with classical MDS anchored to known positions, detects
//! walls from excess free-space attenuation (per-link segments plus
//! tomography peaks) and partitions the walled graph into rooms. The
//! caller keeps its prior floorplan when calibration fails.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::debug;

use senseye_common::{InferenceConfig, MappingConfig, NodeId, Point};
use senseye_fusion::{reconstruct, DistanceMatrix, GridSpec, LinkSample};
use senseye_mapping::{
    dedupe_walls, detect_walls, infer_rooms_from_nodes, walls_from_field, FloorPlan, WallGrid,
    WallSegment,
};

use senseye_fusion::ranging::MAX_COMPLETION_HOPS;

use crate::inference::{distance_from_rssi, expected_rssi};

/// Narrowest usable device distance (meters).
const MIN_DISTANCE: f64 = 0.5;
/// Widest usable device distance (meters).
const MAX_DISTANCE: f64 = 25.0;
/// Margin added around the node hull when deriving bounds (meters).
const BOUNDS_MARGIN: f64 = 1.5;

/// Calibration failures. The node continues with its prior floorplan.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// Not enough participants to lay anything out.
    #[error("insufficient nodes for layout: {0}")]
    InsufficientNodes(usize),

    /// Participants exist but no usable distance observations anchor them.
    #[error("no usable range observations")]
    InsufficientAnchors,

    /// The acoustic round failed outright.
    #[error("acoustic round failed: {0}")]
    AcousticFailure(String),
}

/// Everything the pure calibration step consumes.
#[derive(Debug, Clone, Default)]
pub struct CalibrationInputs {
    /// This node's id
    pub node_id: NodeId,
    /// This node's display name
    pub node_name: String,
    /// Known peer node ids
    pub peers: Vec<NodeId>,
    /// Mean RSSI per observed device (dBm)
    pub device_rssi: BTreeMap<NodeId, f64>,
    /// Display labels discovered during scanning
    pub device_labels: BTreeMap<NodeId, String>,
    /// Direct acoustic ranges from this node (meters)
    pub acoustic_ranges: BTreeMap<NodeId, f64>,
    /// Acoustic ranges gossiped by peers: (a, b, meters)
    pub peer_acoustic_ranges: Vec<(NodeId, NodeId, f64)>,
    /// This node's configured position, if fixed
    pub anchor_position: Option<Point>,
    /// Positions announced by fixed peers
    pub peer_positions: BTreeMap<NodeId, Point>,
    /// Path-loss parameters
    pub inference: InferenceConfig,
    /// Grid/wall parameters
    pub mapping: MappingConfig,
    /// Cap on devices folded into the layout
    pub max_devices: usize,
    /// Calibration timestamp
    pub now: f64,
}

/// Runs the calibration pipeline over gathered observations.
///
/// # Errors
///
/// [`CalibrationError::InsufficientNodes`] with fewer than two
/// participants, [`CalibrationError::InsufficientAnchors`] when no
/// distance estimate ties the participants together.
pub fn calibrate(inputs: &CalibrationInputs) -> Result<FloorPlan, CalibrationError> {
    // Strongest devices first, peers always included.
    let mut ordered_devices: Vec<&NodeId> = inputs
        .device_rssi
        .keys()
        .filter(|id| !inputs.peers.contains(*id) && **id != inputs.node_id)
        .collect();
    ordered_devices.sort_by(|a, b| {
        inputs.device_rssi[*b]
            .partial_cmp(&inputs.device_rssi[*a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let selected: Vec<NodeId> = ordered_devices
        .into_iter()
        .take(inputs.max_devices)
        .cloned()
        .collect();

    let acoustic_only: Vec<NodeId> = inputs
        .acoustic_ranges
        .keys()
        .filter(|id| {
            **id != inputs.node_id
                && !inputs.peers.contains(*id)
                && !selected.contains(*id)
        })
        .cloned()
        .collect();

    let mut node_ids: Vec<NodeId> = Vec::new();
    node_ids.push(inputs.node_id.clone());
    node_ids.extend(inputs.peers.iter().cloned());
    node_ids.extend(selected.iter().cloned());
    node_ids.extend(acoustic_only);

    if node_ids.len() < 2 {
        return Err(CalibrationError::InsufficientNodes(node_ids.len()));
    }

    // Seed distances from this node to every participant.
    let mut dist_to_self: HashMap<NodeId, f64> = HashMap::new();
    for (idx, peer) in inputs.peers.iter().enumerate() {
        // Peer ranges without acoustic data get a stable seed spacing.
        dist_to_self.insert(peer.clone(), 2.5 + idx as f64 * 0.5);
    }
    for device in &selected {
        let distance = distance_from_rssi(
            inputs.device_rssi[device],
            inputs.inference.pathloss_n,
            inputs.inference.pathloss_a,
        );
        dist_to_self.insert(device.clone(), distance.clamp(MIN_DISTANCE, MAX_DISTANCE));
    }
    for (target, &distance) in &inputs.acoustic_ranges {
        if node_ids.contains(target) {
            dist_to_self.insert(target.clone(), distance.clamp(MIN_DISTANCE, MAX_DISTANCE));
        }
    }

    if inputs.peers.is_empty() && dist_to_self.is_empty() {
        return Err(CalibrationError::InsufficientAnchors);
    }

    // RF matrix: measured first-hop distances, angular prior for the rest.
    let mut rf = DistanceMatrix::zeros(node_ids.clone());
    for (i, id) in node_ids.iter().enumerate().skip(1) {
        if let Some(&d) = dist_to_self.get(id) {
            rf.set(0, i, d);
        }
    }
    rf.fill_angular_prior(MAX_DISTANCE);

    // Acoustic matrix: own ranges plus gossiped peer pairs, completed over
    // bounded relay hops.
    let mut acoustic = DistanceMatrix::zeros(node_ids.clone());
    let index: HashMap<&str, usize> = node_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    for (target, &distance) in &inputs.acoustic_ranges {
        if let Some(&i) = index.get(target.as_str()) {
            acoustic.set(0, i, distance.clamp(MIN_DISTANCE, MAX_DISTANCE));
        }
    }
    for (a, b, distance) in &inputs.peer_acoustic_ranges {
        if let (Some(&i), Some(&j)) = (index.get(a.as_str()), index.get(b.as_str())) {
            if i != j && *distance > 0.0 {
                acoustic.set(i, j, distance.clamp(MIN_DISTANCE, MAX_DISTANCE));
            }
        }
    }
    acoustic.complete_bounded_hops(MAX_COMPLETION_HOPS);

    let merged = DistanceMatrix::merge(&acoustic, &rf);
    if (1..node_ids.len()).all(|i| merged.distances[(0, i)] <= 0.0) {
        return Err(CalibrationError::InsufficientAnchors);
    }

    // Layout: MDS anchored at this node (and one positioned peer, if any).
    let mut positions = senseye_mapping::mds_positions(&merged);
    let own_anchor = inputs.anchor_position.unwrap_or_default();
    let mut anchors = vec![(0usize, own_anchor)];
    if let Some((peer, position)) = inputs
        .peer_positions
        .iter()
        .find(|(peer, _)| index.contains_key(peer.as_str()))
    {
        anchors.push((index[peer.as_str()], *position));
    }
    senseye_mapping::apply_anchors(&mut positions, &anchors);

    let mut node_positions: BTreeMap<NodeId, Point> = BTreeMap::new();
    for (i, id) in node_ids.iter().enumerate() {
        node_positions.insert(id.clone(), positions[i]);
    }

    // Wall candidates from excess free-space attenuation. The free-space
    // exponent makes every obstruction visible as excess loss.
    let mut link_attenuations: BTreeMap<senseye_common::PairKey, f64> = BTreeMap::new();
    for device in &selected {
        let rssi = inputs.device_rssi[device];
        let est_distance = dist_to_self[device];
        let expected = expected_rssi(
            est_distance.max(MIN_DISTANCE),
            inputs.inference.pathloss_n_freespace,
            inputs.inference.pathloss_a,
        );
        let attenuation = (expected - rssi).max(0.0);
        if attenuation > 0.0 {
            link_attenuations.insert(
                senseye_common::PairKey::new(inputs.node_id.as_str(), device.as_str()),
                attenuation,
            );
        }
    }

    let mut walls = detect_walls(
        &node_positions,
        &link_attenuations,
        inputs.mapping.wall_threshold_db,
    );

    let bounds = derive_bounds(&node_positions, &walls);
    let spec = GridSpec::new(bounds, inputs.mapping.resolution);
    let tomography_links: Vec<LinkSample> = link_attenuations
        .iter()
        .filter_map(|(pair, &attenuation)| {
            let a = node_positions.get(pair.first())?;
            let b = node_positions.get(pair.second())?;
            Some(LinkSample {
                a: *a,
                b: *b,
                excess_db: attenuation,
                confidence: (0.4 + attenuation / 20.0).clamp(0.05, 1.0),
            })
        })
        .collect();

    let field = match reconstruct(
        &tomography_links,
        &spec,
        inputs.mapping.influence_radius,
        inputs.mapping.ridge_constant,
    ) {
        Ok(field) => field,
        Err(e) => {
            // Rank deficiency degrades to a plan without a tomography grid.
            debug!("tomography skipped: {e}");
            senseye_fusion::AttenuationField::empty(spec)
        }
    };
    walls.extend(walls_from_field(&field, inputs.mapping.wall_threshold_db));
    let walls = dedupe_walls(walls);

    let rooms = infer_rooms_from_nodes(&node_positions, &walls);

    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    labels.insert(inputs.node_id.clone(), inputs.node_name.clone());
    for peer in &inputs.peers {
        labels.insert(peer.clone(), format!("peer-{}", truncate(peer, 6)));
    }
    for device in &selected {
        let label = inputs
            .device_labels
            .get(device)
            .cloned()
            .unwrap_or_else(|| truncate(device, 8).to_string());
        labels.insert(device.clone(), label);
    }
    for room in &rooms.rooms {
        labels
            .entry(room.name.clone())
            .or_insert_with(|| room.name.replace('_', " "));
    }

    let bounds = derive_bounds(&node_positions, &walls);
    let baseline_rssi: BTreeMap<NodeId, f64> = selected
        .iter()
        .map(|device| (device.clone(), inputs.device_rssi[device]))
        .collect();

    Ok(FloorPlan {
        node_positions,
        walls,
        rooms,
        bounds,
        labels,
        wall_grid: (!field.is_empty()).then(|| WallGrid::from_field(&field)),
        baseline_rssi,
        built_at: inputs.now,
    })
}

fn truncate(s: &str, len: usize) -> &str {
    &s[..s.len().min(len)]
}

fn derive_bounds(
    node_positions: &BTreeMap<NodeId, Point>,
    walls: &[WallSegment],
) -> (f64, f64, f64, f64) {
    let mut xs: Vec<f64> = node_positions.values().map(|p| p.x).collect();
    let mut ys: Vec<f64> = node_positions.values().map(|p| p.y).collect();
    for wall in walls {
        xs.extend([wall.start.x, wall.end.x]);
        ys.extend([wall.start.y, wall.end.y]);
    }
    if xs.is_empty() {
        return (-2.0, -2.0, 2.0, 2.0);
    }

    let fold = |v: &[f64], init: f64, f: fn(f64, f64) -> f64| v.iter().fold(init, |a, &b| f(a, b));
    let mut x_min = fold(&xs, f64::INFINITY, f64::min) - BOUNDS_MARGIN;
    let mut x_max = fold(&xs, f64::NEG_INFINITY, f64::max) + BOUNDS_MARGIN;
    let mut y_min = fold(&ys, f64::INFINITY, f64::min) - BOUNDS_MARGIN;
    let mut y_max = fold(&ys, f64::NEG_INFINITY, f64::max) + BOUNDS_MARGIN;

    if x_max - x_min < 2.0 {
        x_min -= 1.0;
        x_max += 1.0;
    }
    if y_max - y_min < 2.0 {
        y_min -= 1.0;
        y_max += 1.0;
    }
    (x_min, y_min, x_max, y_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> CalibrationInputs {
        CalibrationInputs {
            node_id: "self".into(),
            node_name: "living-room".into(),
            max_devices: 8,
            now: 1000.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_insufficient_nodes() {
        let inputs = base_inputs();
        assert!(matches!(
            calibrate(&inputs),
            Err(CalibrationError::InsufficientNodes(1))
        ));
    }

    #[test]
    fn test_two_peers_build_a_plan() {
        let mut inputs = base_inputs();
        inputs.peers = vec!["peer-a".into(), "peer-b".into()];
        inputs.acoustic_ranges.insert("peer-a".into(), 3.0);
        inputs.acoustic_ranges.insert("peer-b".into(), 4.0);

        let plan = calibrate(&inputs).unwrap();
        assert_eq!(plan.node_positions.len(), 3);
        assert!(!plan.rooms.rooms.is_empty());
        assert_eq!(plan.built_at, 1000.0);
        // The anchored node sits at the origin.
        assert!(plan.node_positions["self"].magnitude() < 1e-6);
        // Acoustic ranges survive into the layout geometry.
        let a = plan.node_positions["peer-a"];
        assert!((a.magnitude() - 3.0).abs() < 0.5, "peer-a at {a}");
    }

    #[test]
    fn test_devices_fold_into_layout_with_baseline() {
        let mut inputs = base_inputs();
        inputs.peers = vec!["peer-a".into()];
        inputs.acoustic_ranges.insert("peer-a".into(), 3.0);
        inputs.device_rssi.insert("dev-1".into(), -55.0);
        inputs.device_rssi.insert("dev-2".into(), -75.0);
        inputs
            .device_labels
            .insert("dev-1".into(), "tv".into());

        let plan = calibrate(&inputs).unwrap();
        assert!(plan.node_positions.contains_key("dev-1"));
        assert_eq!(plan.labels["dev-1"], "tv");
        assert_eq!(plan.baseline_rssi["dev-1"], -55.0);
        assert_eq!(plan.baseline_rssi["dev-2"], -75.0);
    }

    #[test]
    fn test_device_cap_respected() {
        let mut inputs = base_inputs();
        inputs.peers = vec!["peer-a".into()];
        inputs.acoustic_ranges.insert("peer-a".into(), 2.0);
        for i in 0..20 {
            inputs
                .device_rssi
                .insert(format!("dev-{i:02}"), -50.0 - i as f64);
        }
        inputs.max_devices = 4;

        let plan = calibrate(&inputs).unwrap();
        // self + peer + 4 devices.
        assert_eq!(plan.node_positions.len(), 6);
        // The strongest devices won the slots.
        assert!(plan.node_positions.contains_key("dev-00"));
        assert!(!plan.node_positions.contains_key("dev-10"));
    }

    #[test]
    fn test_anchor_positions_applied() {
        let mut inputs = base_inputs();
        inputs.peers = vec!["peer-a".into()];
        inputs.acoustic_ranges.insert("peer-a".into(), 5.0);
        inputs.anchor_position = Some(Point::new(10.0, 10.0));
        inputs
            .peer_positions
            .insert("peer-a".into(), Point::new(15.0, 10.0));

        let plan = calibrate(&inputs).unwrap();
        let own = plan.node_positions["self"];
        assert!(own.distance_to(&Point::new(10.0, 10.0)) < 1e-6);
        let peer = plan.node_positions["peer-a"];
        assert!(peer.distance_to(&Point::new(15.0, 10.0)) < 0.5, "peer at {peer}");
    }

    #[test]
    fn test_gossiped_ranges_complete_the_matrix() {
        // self—a measured, a—b gossiped: b still gets a plausible spot
        // through the bounded-hop completion instead of the angular prior.
        let mut inputs = base_inputs();
        inputs.peers = vec!["peer-a".into(), "peer-b".into()];
        inputs.acoustic_ranges.insert("peer-a".into(), 3.0);
        inputs
            .peer_acoustic_ranges
            .push(("peer-a".into(), "peer-b".into(), 2.0));

        let plan = calibrate(&inputs).unwrap();
        let b = plan.node_positions["peer-b"];
        // Upper bound over the relay: 3 + 2.
        assert!(b.magnitude() < 5.5, "peer-b at {b}");
    }

    #[test]
    fn test_obstructed_device_yields_walls() {
        let mut inputs = base_inputs();
        inputs.peers = vec!["peer-a".into()];
        inputs.acoustic_ranges.insert("peer-a".into(), 3.0);
        // Device at an acoustic-confirmed 2 m but 30 dB weaker than the
        // free-space expectation at that range: a serious obstruction.
        inputs.device_rssi.insert("dev-1".into(), -81.0);
        inputs.acoustic_ranges.insert("dev-1".into(), 2.0);

        let plan = calibrate(&inputs).unwrap();
        assert!(
            !plan.walls.is_empty(),
            "30 dB of excess attenuation must produce wall candidates"
        );
        assert!(plan.wall_grid.is_some());
    }

    #[test]
    fn test_bounds_cover_all_nodes() {
        let mut inputs = base_inputs();
        inputs.peers = vec!["peer-a".into(), "peer-b".into()];
        inputs.acoustic_ranges.insert("peer-a".into(), 8.0);
        inputs.acoustic_ranges.insert("peer-b".into(), 6.0);
        let plan = calibrate(&inputs).unwrap();
        let (x_min, y_min, x_max, y_max) = plan.bounds;
        for p in plan.node_positions.values() {
            assert!(p.x >= x_min && p.x <= x_max);
            assert!(p.y >= y_min && p.y <= y_max);
        }
    }
}
