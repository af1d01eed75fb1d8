//! Pipeline task: the per-node sensing and fusion cycle.
//!
//! Owns the filter bank, the peer belief window and the world state. One
//! cycle per scan interval: drain the scanner into the Kalman bank, infer
//! the local belief, hand it to the mesh, fuse it with the latest
//! non-stale peer beliefs, position devices, refresh the tomography
//! overlay and publish an immutable snapshot. Beliefs arriving mid-cycle
//! wait in the event queue until the next cycle, so each fusion sees a
//! consistent input set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use senseye_common::{now_ts, NodeId, Point, SenseyeConfig, SignalKind, AcousticMode};
use senseye_fusion::{
    fuse_beliefs, reconstruct, trilateration::trilaterate_default, EdgeState, GridSpec,
    LinkSample, RangeObservation, SignalGraph, Vertex,
};
use senseye_mapping::{
    update_topology, update_world, CalibrationStatus, FloorPlan, RecalibrationPolicy, WallGrid,
    WorldSnapshot, WorldState,
};
use senseye_protocol::{Belief, WireMessage};

use crate::acoustic::{self, AcousticDevice};
use crate::calibration::{calibrate, CalibrationError, CalibrationInputs};
use crate::filter::FilterBank;
use crate::inference::{infer, InferenceContext, ZoneSpec};
use crate::mesh::{MeshCommand, MeshEvent};
use crate::scanner::Scanner;
use crate::tasks::{TaskHandle, TaskMessage};

/// Seconds between failed calibration attempts.
const CALIBRATION_RETRY_S: f64 = 30.0;
/// Devices older than this drop out of snapshots (seconds).
const DEVICE_MAX_AGE_S: f64 = 60.0;
/// Devices folded into a calibration layout.
const CALIBRATION_MAX_DEVICES: usize = 8;

/// Messages accepted by the pipeline task.
#[derive(Debug)]
pub enum PipelineMessage {
    /// Run a calibration now; the result goes to `reply` when present.
    Calibrate {
        /// Completion channel for CLI-triggered runs
        reply: Option<oneshot::Sender<Result<(), String>>>,
    },
}

/// The sensing/fusion pipeline actor.
pub struct PipelineTask {
    config: SenseyeConfig,
    scanner: Box<dyn Scanner>,
    acoustic_device: Option<Arc<dyn AcousticDevice>>,
    bank: FilterBank,
    world: WorldState,
    graph: SignalGraph,
    policy: RecalibrationPolicy,
    peer_beliefs: BTreeMap<NodeId, Belief>,
    connected_peers: BTreeSet<NodeId>,
    previous_zones: BTreeMap<NodeId, String>,
    zone_transitions: Vec<(String, String, f64)>,
    sequence: u64,
    request_counter: u64,
    last_cycle: Option<f64>,
    last_broadcast: f64,
    last_calibration_attempt: f64,
}

impl PipelineTask {
    /// Creates the pipeline with an optional previously-saved floorplan.
    pub fn new(
        config: SenseyeConfig,
        scanner: Box<dyn Scanner>,
        acoustic_device: Option<Arc<dyn AcousticDevice>>,
        floorplan: Option<FloorPlan>,
    ) -> Self {
        let bank = FilterBank::new(config.filter.clone());
        let mut world = WorldState {
            floorplan,
            ..Default::default()
        };
        if world.floorplan.is_some() {
            world.calibration_status = CalibrationStatus::Ready;
        }
        Self {
            bank,
            world,
            graph: SignalGraph::new(),
            policy: RecalibrationPolicy::new(BTreeSet::new(), now_ts()),
            peer_beliefs: BTreeMap::new(),
            connected_peers: BTreeSet::new(),
            previous_zones: BTreeMap::new(),
            zone_transitions: Vec::new(),
            sequence: 0,
            request_counter: 0,
            last_cycle: None,
            last_broadcast: f64::NEG_INFINITY,
            last_calibration_attempt: f64::NEG_INFINITY,
            scanner,
            acoustic_device,
            config,
        }
    }

    /// Runs the pipeline until shutdown.
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<TaskMessage<PipelineMessage>>,
        mut mesh_events: mpsc::Receiver<MeshEvent>,
        mesh_tx: TaskHandle<MeshCommand>,
        snapshot_tx: watch::Sender<WorldSnapshot>,
    ) {
        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_secs_f64(self.config.scan_interval_s));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle(&mesh_tx, &snapshot_tx).await;
                }
                message = inbox.recv() => {
                    match message {
                        Some(TaskMessage::Message(PipelineMessage::Calibrate { reply })) => {
                            let result = self.run_calibration(&mesh_tx).await;
                            if let Some(reply) = reply {
                                let _ = reply.send(result.map_err(|e| e.to_string()));
                            }
                        }
                        Some(TaskMessage::Shutdown) | None => break,
                    }
                }
                Some(event) = mesh_events.recv() => {
                    self.handle_mesh_event(event, &mesh_tx).await;
                }
            }
        }
        info!("pipeline stopped");
    }

    /// One SCAN → FILTER → INFER → SHARE ↔ FUSE → WORLD cycle.
    pub(crate) async fn cycle(
        &mut self,
        mesh_tx: &TaskHandle<MeshCommand>,
        snapshot_tx: &watch::Sender<WorldSnapshot>,
    ) {
        let now = now_ts();
        let dt = self.last_cycle.map(|last| now - last).unwrap_or(0.0);
        self.last_cycle = Some(now);

        // SCAN + FILTER
        match self.scanner.scan().await {
            Ok(measurements) => {
                for measurement in &measurements {
                    self.bank.apply(measurement);
                }
            }
            Err(e) => debug!("scan skipped: {e}"),
        }
        self.bank.purge_stale(now);

        // INFER
        self.sequence += 1;
        let node_positions = self.node_positions();
        let zones = self.zone_specs();
        let local = infer(
            &self.bank,
            &InferenceContext {
                node_id: &self.config.node_id,
                node_positions: &node_positions,
                zones: &zones,
                config: &self.config.inference,
            },
            now,
            self.sequence,
            self.config.mesh.hop_limit,
        );

        // SHARE at the configured heartbeat rate.
        if now - self.last_broadcast >= 1.0 / self.config.mesh.belief_rate {
            self.last_broadcast = now;
            if let Err(e) = mesh_tx.send(MeshCommand::Broadcast(local.clone())).await {
                debug!("broadcast skipped: {e}");
            }
        }

        // FUSE over the latest non-stale belief per origin.
        let peers: Vec<Belief> = self
            .peer_beliefs
            .values()
            .filter(|belief| !belief.is_stale(now, self.config.mesh.staleness_s))
            .cloned()
            .collect();
        let fused = fuse_beliefs(&local, &peers, self.config.fusion.disagreement_scale);

        // Device positioning from every contributor's range estimates.
        let device_positions = self.position_devices(&local, &peers, &node_positions);

        // Refresh the signal graph from the fused view.
        self.update_graph(&fused, &node_positions, now);

        // Runtime tomography overlay on the calibrated grid.
        self.world.live_attenuation = self.reconstruct_overlay(&node_positions).await;

        // WORLD
        let mut online: BTreeSet<NodeId> = self.connected_peers.clone();
        online.insert(self.config.node_id.clone());
        update_world(
            &mut self.world,
            &fused,
            dt,
            &device_positions,
            &online,
            &self.config.world,
            now,
        );
        self.world.devices.cleanup(now, DEVICE_MAX_AGE_S);
        self.track_zone_transitions(now);

        // Recalibration policy.
        let interval = (self.config.acoustic.mode == AcousticMode::Interval)
            .then_some(self.config.acoustic.interval_s);
        if now - self.last_calibration_attempt > CALIBRATION_RETRY_S
            && self.policy.should_recalibrate(
                self.world.floorplan.as_ref(),
                &self.connected_peers,
                &self.current_device_rssi(),
                interval,
                &self.config.world,
                now,
            )
        {
            if let Err(e) = self.run_calibration(mesh_tx).await {
                debug!("automatic calibration failed: {e}");
            }
        }

        // RENDER handoff.
        let _ = snapshot_tx.send(self.world.snapshot(now, DEVICE_MAX_AGE_S));
    }

    async fn handle_mesh_event(&mut self, event: MeshEvent, mesh_tx: &TaskHandle<MeshCommand>) {
        match event {
            MeshEvent::BeliefReceived(belief) => {
                // Keep only the newest sequence per origin.
                match self.peer_beliefs.get(&belief.node_id) {
                    Some(existing) if existing.sequence_number >= belief.sequence_number => {}
                    _ => {
                        self.peer_beliefs.insert(belief.node_id.clone(), belief);
                    }
                }
            }
            MeshEvent::PeerConnected(peer) => {
                self.connected_peers.insert(peer);
            }
            MeshEvent::PeerDisconnected(peer) => {
                self.connected_peers.remove(&peer);
            }
            MeshEvent::AcousticPing {
                from,
                request_id,
                delay_s,
                freq_start,
                freq_end,
                chirp_duration,
                ..
            } => {
                let (ok, error) = match &self.acoustic_device {
                    Some(device) => {
                        tokio::time::sleep(tokio::time::Duration::from_secs_f64(
                            delay_s.clamp(0.0, 5.0),
                        ))
                        .await;
                        match device.play_chirp(freq_start, freq_end, chirp_duration).await {
                            Ok(_) => (true, None),
                            Err(e) => (false, Some(e.to_string())),
                        }
                    }
                    None => (false, Some("no audio device".to_string())),
                };
                let _ = mesh_tx
                    .send(MeshCommand::SendTo {
                        peer: from,
                        message: WireMessage::AcousticPong {
                            request_id,
                            ok,
                            error,
                        },
                    })
                    .await;
            }
            MeshEvent::AcousticPong {
                from,
                request_id,
                ok,
            } => {
                debug!(peer = %from, request_id, ok, "acoustic pong");
            }
        }
    }

    /// Node positions known right now: calibrated plan first, announced
    /// or configured positions as fallback.
    fn node_positions(&self) -> BTreeMap<NodeId, Point> {
        let mut positions = self
            .world
            .floorplan
            .as_ref()
            .map(|plan| plan.node_positions.clone())
            .unwrap_or_default();
        if let Some(own) = self.config.position {
            positions.entry(self.config.node_id.clone()).or_insert(own);
        }
        positions
    }

    /// Zone definitions: for each room, the links from here to its nodes.
    fn zone_specs(&self) -> Vec<ZoneSpec> {
        let Some(plan) = &self.world.floorplan else {
            return Vec::new();
        };
        plan.rooms
            .rooms
            .iter()
            .map(|room| ZoneSpec {
                name: room.name.clone(),
                links: room
                    .node_ids
                    .iter()
                    .filter(|id| **id != self.config.node_id)
                    .map(|id| senseye_common::PairKey::new(self.config.node_id.as_str(), id.as_str()))
                    .collect(),
            })
            .filter(|zone| !zone.links.is_empty())
            .collect()
    }

    /// Trilaterates devices from per-anchor range estimates.
    fn position_devices(
        &self,
        local: &Belief,
        peers: &[Belief],
        node_positions: &BTreeMap<NodeId, Point>,
    ) -> BTreeMap<NodeId, Point> {
        let mut by_device: BTreeMap<NodeId, Vec<RangeObservation>> = BTreeMap::new();
        for belief in std::iter::once(local).chain(peers.iter()) {
            let Some(&anchor) = node_positions.get(&belief.node_id) else {
                continue;
            };
            for (device_id, device) in &belief.devices {
                if node_positions.contains_key(device_id) {
                    continue;
                }
                if device.distance_m <= 0.0
                    || device.distance_m > self.config.fusion.max_device_range
                {
                    continue;
                }
                by_device
                    .entry(device_id.clone())
                    .or_default()
                    .push(RangeObservation::new(anchor, device.distance_m));
            }
        }

        let mut positions = BTreeMap::new();
        for (device_id, observations) in by_device {
            if observations.len() < self.config.fusion.min_anchors {
                continue;
            }
            match trilaterate_default(&observations) {
                Ok(fix) => {
                    positions.insert(device_id, fix.position);
                }
                Err(e) => debug!(device = %device_id, "trilateration failed: {e}"),
            }
        }
        positions
    }

    /// Folds the fused belief into the signal graph.
    fn update_graph(
        &mut self,
        fused: &Belief,
        node_positions: &BTreeMap<NodeId, Point>,
        now: f64,
    ) {
        for (id, &position) in node_positions {
            self.graph.upsert_vertex(Vertex {
                id: id.clone(),
                position: Some(position),
                fixed: true,
            });
        }
        for (pair, link) in &fused.links {
            let rssi_dbm = fused
                .devices
                .get(pair.other(&self.config.node_id).unwrap_or_default())
                .map(|device| device.rssi_dbm)
                .unwrap_or(0.0);
            self.graph.upsert_edge(
                pair.clone(),
                EdgeState {
                    rssi_dbm,
                    attenuation_db: link.attenuation_db,
                    confidence: link.confidence,
                    motion: link.motion_prob > 0.5,
                    timestamp: now,
                },
            );
        }
        self.graph.prune_stale_edges(now, self.config.mesh.staleness_s.max(30.0));
    }

    /// Rebuilds the live attenuation overlay from the signal graph.
    async fn reconstruct_overlay(
        &self,
        node_positions: &BTreeMap<NodeId, Point>,
    ) -> Option<WallGrid> {
        let plan = self.world.floorplan.as_ref()?;
        let links: Vec<LinkSample> = self
            .graph
            .edges()
            .filter(|(_, edge)| edge.attenuation_db > 0.0)
            .filter_map(|(pair, edge)| {
                Some(LinkSample {
                    a: *node_positions.get(pair.first())?,
                    b: *node_positions.get(pair.second())?,
                    excess_db: edge.attenuation_db,
                    confidence: edge.confidence,
                })
            })
            .collect();
        if links.is_empty() {
            return None;
        }

        let spec = GridSpec::new(plan.bounds, self.config.mapping.resolution);
        let radius = self.config.mapping.influence_radius;
        let kappa = self.config.mapping.ridge_constant;
        // The solve is dense linear algebra; keep it off the event loop.
        let field = tokio::task::spawn_blocking(move || reconstruct(&links, &spec, radius, kappa))
            .await
            .ok()?
            .ok()?;
        (!field.is_empty()).then(|| WallGrid::from_field(&field))
    }

    /// Records device zone changes and folds repeated traversals into the
    /// room topology as inferred doorways.
    fn track_zone_transitions(&mut self, now: f64) {
        let devices = self.world.devices.active(now, DEVICE_MAX_AGE_S);
        for (device_id, device) in devices {
            let Some(zone) = device.zone else { continue };
            match self.previous_zones.get(&device_id) {
                Some(previous) if *previous != zone => {
                    self.zone_transitions
                        .push((previous.clone(), zone.clone(), now));
                }
                _ => {}
            }
            self.previous_zones.insert(device_id, zone);
        }

        if self.zone_transitions.is_empty() {
            return;
        }
        if let Some(plan) = &mut self.world.floorplan {
            let updated = update_topology(&plan.rooms, &self.zone_transitions);
            if updated.doorways.len() > plan.rooms.doorways.len() {
                debug!(
                    doorways = updated.doorways.len(),
                    "topology updated from motion traces"
                );
                plan.rooms = updated;
            }
        }
        // Bound the trace buffer; old transitions have served their purpose.
        if self.zone_transitions.len() > 256 {
            let excess = self.zone_transitions.len() - 256;
            self.zone_transitions.drain(..excess);
        }
    }

    /// Current filtered RSSI per RF device, for the drift trigger.
    fn current_device_rssi(&self) -> BTreeMap<NodeId, f64> {
        self.bank
            .paths()
            .filter(|((source, _), path)| {
                *source == self.config.node_id && path.kind() != SignalKind::Acoustic
            })
            .map(|((_, target), path)| (target.clone(), path.filtered()))
            .collect()
    }

    /// Runs one calibration round and installs the resulting floorplan.
    async fn run_calibration(
        &mut self,
        mesh_tx: &TaskHandle<MeshCommand>,
    ) -> Result<(), CalibrationError> {
        let now = now_ts();
        self.last_calibration_attempt = now;
        self.world.calibration_status = CalibrationStatus::Running;
        info!(peers = self.connected_peers.len(), "calibration started");

        let mut acoustic_ranges = self.own_acoustic_ranges();
        if self.config.acoustic.mode != AcousticMode::Off {
            match self.acoustic_round(mesh_tx).await {
                Ok(measured) => acoustic_ranges.extend(measured),
                Err(e) => warn!("acoustic round degraded: {e}"),
            }
        }

        let inputs = CalibrationInputs {
            node_id: self.config.node_id.clone(),
            node_name: self.config.node_name.clone(),
            peers: self.connected_peers.iter().cloned().collect(),
            device_rssi: self.current_device_rssi(),
            device_labels: BTreeMap::new(),
            acoustic_ranges,
            peer_acoustic_ranges: self.gossiped_acoustic_ranges(),
            anchor_position: self.config.position,
            peer_positions: BTreeMap::new(),
            inference: self.config.inference.clone(),
            mapping: self.config.mapping.clone(),
            max_devices: CALIBRATION_MAX_DEVICES,
            now,
        };

        let result = tokio::task::spawn_blocking(move || calibrate(&inputs))
            .await
            .map_err(|e| CalibrationError::AcousticFailure(format!("calibration task: {e}")))?;

        match result {
            Ok(plan) => {
                if let Err(e) = plan.save(&self.config.floorplan_path()) {
                    warn!("floorplan save failed: {e}");
                }
                self.world.floorplan = Some(plan);
                self.world.calibration_status = CalibrationStatus::Ready;
                self.policy = RecalibrationPolicy::new(self.connected_peers.clone(), now);
                info!("calibration complete");
                Ok(())
            }
            Err(e) => {
                // Keep whatever plan we had; surface the failure in status.
                self.world.calibration_status = if self.world.floorplan.is_some() {
                    CalibrationStatus::Ready
                } else {
                    CalibrationStatus::Failed
                };
                warn!("calibration failed: {e}");
                Err(e)
            }
        }
    }

    /// Acoustic ranges already measured on our own paths.
    fn own_acoustic_ranges(&self) -> BTreeMap<NodeId, f64> {
        self.bank
            .paths()
            .filter(|((source, _), path)| {
                *source == self.config.node_id && path.kind() == SignalKind::Acoustic
            })
            .map(|((_, target), path)| (target.clone(), path.filtered().max(0.1)))
            .collect()
    }

    /// Acoustic ranges gossiped in peer beliefs.
    fn gossiped_acoustic_ranges(&self) -> Vec<(NodeId, NodeId, f64)> {
        self.peer_beliefs
            .values()
            .flat_map(|belief| {
                belief
                    .acoustic_ranges
                    .iter()
                    .map(|(target, &distance)| (belief.node_id.clone(), target.clone(), distance))
            })
            .collect()
    }

    /// One chirp round: every peer is asked to chirp on its own channel
    /// while we record, and the matched-filter peak dates its arrival.
    ///
    /// Best-effort ranging: network latency rides on top of the acoustic
    /// delay (clock sync is out of scope), so results are upper bounds.
    async fn acoustic_round(
        &mut self,
        mesh_tx: &TaskHandle<MeshCommand>,
    ) -> Result<BTreeMap<NodeId, f64>, CalibrationError> {
        let device = self
            .acoustic_device
            .as_ref()
            .ok_or_else(|| CalibrationError::AcousticFailure("no audio device".to_string()))?
            .clone();

        let delay_s = 0.5;
        let sample_rate = self.config.acoustic.sample_rate;
        let chirp_duration = self.config.acoustic.chirp_duration;
        let mut ranges = BTreeMap::new();

        for peer in self.connected_peers.clone() {
            self.request_counter += 1;
            let sent = mesh_tx
                .send(MeshCommand::SendTo {
                    peer: peer.clone(),
                    message: WireMessage::AcousticPing {
                        request_id: self.request_counter,
                        delay_s,
                        sample_rate,
                        freq_start: acoustic::chirp_channel(&peer).0,
                        freq_end: acoustic::chirp_channel(&peer).1,
                        chirp_duration,
                    },
                })
                .await;
            if sent.is_err() {
                continue;
            }

            let record_s = delay_s + chirp_duration + 0.5;
            let (samples, _started) = device
                .record(record_s)
                .await
                .map_err(|e| CalibrationError::AcousticFailure(e.to_string()))?;

            let (f_start, f_end) = acoustic::chirp_channel(&peer);
            let template =
                acoustic::generate_chirp(f_start, f_end, chirp_duration, sample_rate);
            let correlation = acoustic::matched_filter(&samples, &template);
            if let Some(tof) = acoustic::find_peak_tof(&correlation, sample_rate, 0) {
                let flight = (tof - delay_s).max(0.0);
                let distance = acoustic::tof_to_distance(flight);
                if distance > 0.0 && distance < 50.0 {
                    ranges.insert(peer, distance);
                }
            }
        }
        Ok(ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ReplayScanner;
    use senseye_common::Measurement;

    fn measurement(target: &str, value: f64, t: f64) -> Measurement {
        Measurement {
            source: "node-a".into(),
            target: target.into(),
            kind: SignalKind::Wifi,
            timestamp: t,
            value,
            snr: None,
        }
    }

    fn test_config() -> SenseyeConfig {
        let mut config = SenseyeConfig::default();
        config.node_id = "node-a".into();
        config.node_name = "node-a".into();
        config.data_dir = std::env::temp_dir().join("senseye-test-never-written");
        // Back-to-back test cycles must each emit a heartbeat.
        config.mesh.belief_rate = f64::INFINITY;
        config
    }

    fn harness() -> (
        PipelineTask,
        TaskHandle<MeshCommand>,
        mpsc::Receiver<TaskMessage<MeshCommand>>,
        watch::Sender<WorldSnapshot>,
        watch::Receiver<WorldSnapshot>,
    ) {
        let (mesh_tx, mesh_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(WorldSnapshot::default());
        let batches = vec![
            vec![
                measurement("dev-1", -55.0, now_ts()),
                measurement("dev-2", -70.0, now_ts()),
            ];
            3
        ];
        let mut pipeline = PipelineTask::new(
            test_config(),
            Box::new(ReplayScanner::new(batches)),
            None,
            None,
        );
        // A fresh node has no floorplan; pin the retry window so cycles in
        // tests never kick off an automatic calibration mid-assert.
        pipeline.last_calibration_attempt = now_ts();
        (
            pipeline,
            TaskHandle::new(mesh_tx),
            mesh_rx,
            snapshot_tx,
            snapshot_rx,
        )
    }

    #[tokio::test]
    async fn test_cycle_broadcasts_and_snapshots() {
        let (mut pipeline, mesh_tx, mut mesh_rx, snapshot_tx, snapshot_rx) = harness();

        pipeline.cycle(&mesh_tx, &snapshot_tx).await;

        let broadcast = mesh_rx.try_recv().expect("cycle must broadcast");
        match broadcast {
            TaskMessage::Message(MeshCommand::Broadcast(belief)) => {
                assert_eq!(belief.node_id, "node-a");
                assert_eq!(belief.sequence_number, 1);
                assert!(belief.devices.contains_key("dev-1"));
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let snapshot = snapshot_rx.borrow();
        assert!(snapshot.devices.contains_key("dev-1"));
        assert!(snapshot.devices.contains_key("dev-2"));
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase() {
        let (mut pipeline, mesh_tx, mut mesh_rx, snapshot_tx, _snapshot_rx) = harness();
        pipeline.cycle(&mesh_tx, &snapshot_tx).await;
        pipeline.cycle(&mesh_tx, &snapshot_tx).await;

        let mut sequences = Vec::new();
        while let Ok(TaskMessage::Message(MeshCommand::Broadcast(belief))) = mesh_rx.try_recv() {
            sequences.push(belief.sequence_number);
        }
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_peer_beliefs_join_fusion() {
        let (mut pipeline, mesh_tx, _mesh_rx, snapshot_tx, snapshot_rx) = harness();

        let mut peer_belief = Belief::new("node-b", now_ts(), 4);
        peer_belief.devices.insert(
            "dev-9".into(),
            senseye_protocol::DeviceBelief {
                rssi_dbm: -60.0,
                distance_m: 4.0,
                moving: false,
                confidence: 0.7,
            },
        );
        pipeline
            .handle_mesh_event(MeshEvent::BeliefReceived(peer_belief), &mesh_tx)
            .await;

        pipeline.cycle(&mesh_tx, &snapshot_tx).await;
        assert!(snapshot_rx.borrow().devices.contains_key("dev-9"));
    }

    #[tokio::test]
    async fn test_older_sequence_does_not_replace_newer() {
        let (mut pipeline, mesh_tx, _mesh_rx, _snapshot_tx, _snapshot_rx) = harness();

        let newer = Belief::new("node-b", now_ts(), 10);
        let older = Belief::new("node-b", now_ts(), 3);
        pipeline
            .handle_mesh_event(MeshEvent::BeliefReceived(newer), &mesh_tx)
            .await;
        pipeline
            .handle_mesh_event(MeshEvent::BeliefReceived(older), &mesh_tx)
            .await;
        assert_eq!(pipeline.peer_beliefs["node-b"].sequence_number, 10);
    }

    #[tokio::test]
    async fn test_stale_peer_beliefs_excluded() {
        let (mut pipeline, mesh_tx, _mesh_rx, snapshot_tx, snapshot_rx) = harness();

        let mut stale = Belief::new("node-b", now_ts() - 3600.0, 1);
        stale.devices.insert(
            "dev-ghost".into(),
            senseye_protocol::DeviceBelief {
                rssi_dbm: -60.0,
                distance_m: 4.0,
                moving: false,
                confidence: 0.7,
            },
        );
        pipeline
            .handle_mesh_event(MeshEvent::BeliefReceived(stale), &mesh_tx)
            .await;
        pipeline.cycle(&mesh_tx, &snapshot_tx).await;
        assert!(!snapshot_rx.borrow().devices.contains_key("dev-ghost"));
    }

    #[tokio::test]
    async fn test_acoustic_ping_without_device_pongs_failure() {
        let (mut pipeline, mesh_tx, mut mesh_rx, _snapshot_tx, _snapshot_rx) = harness();
        pipeline
            .handle_mesh_event(
                MeshEvent::AcousticPing {
                    from: "node-b".into(),
                    request_id: 5,
                    delay_s: 0.0,
                    sample_rate: 48_000,
                    freq_start: 18_000,
                    freq_end: 19_000,
                    chirp_duration: 0.01,
                },
                &mesh_tx,
            )
            .await;

        match mesh_rx.try_recv().expect("ping must be answered") {
            TaskMessage::Message(MeshCommand::SendTo {
                peer,
                message: WireMessage::AcousticPong {
                    request_id, ok, ..
                },
            }) => {
                assert_eq!(peer, "node-b");
                assert_eq!(request_id, 5);
                assert!(!ok);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_device_positioning_with_three_anchors() {
        let (pipeline, _mesh_tx, _mesh_rx, _snapshot_tx, _snapshot_rx) = harness();

        // Calibrated anchor layout.
        let mut node_positions = BTreeMap::new();
        node_positions.insert("node-a".to_string(), Point::new(0.0, 0.0));
        node_positions.insert("node-b".to_string(), Point::new(10.0, 0.0));
        node_positions.insert("node-c".to_string(), Point::new(0.0, 10.0));

        let target = Point::new(3.0, 4.0);
        let mut local = Belief::new("node-a", now_ts(), 1);
        local.devices.insert(
            "dev".into(),
            senseye_protocol::DeviceBelief {
                rssi_dbm: -60.0,
                distance_m: target.magnitude(),
                moving: false,
                confidence: 0.8,
            },
        );
        let mut peer_b = Belief::new("node-b", now_ts(), 1);
        peer_b.devices.insert(
            "dev".into(),
            senseye_protocol::DeviceBelief {
                rssi_dbm: -60.0,
                distance_m: target.distance_to(&Point::new(10.0, 0.0)),
                moving: false,
                confidence: 0.8,
            },
        );
        let mut peer_c = Belief::new("node-c", now_ts(), 1);
        peer_c.devices.insert(
            "dev".into(),
            senseye_protocol::DeviceBelief {
                rssi_dbm: -60.0,
                distance_m: target.distance_to(&Point::new(0.0, 10.0)),
                moving: false,
                confidence: 0.8,
            },
        );

        let positions =
            pipeline.position_devices(&local, &[peer_b, peer_c], &node_positions);
        let fix = positions["dev"];
        assert!(fix.distance_to(&target) < 0.1, "device at {fix}");
    }
}
