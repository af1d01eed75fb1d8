//! Signal graph: nodes and devices as vertices, observed paths as edges.
//!
//! Vertices live in an arena keyed by stable node id and edges in a map
//! keyed by the unordered endpoint pair, so removing a peer is an index
//! removal rather than a pointer rewrite.

use std::collections::HashMap;

use senseye_common::{NodeId, PairKey, Point};

/// A node or device participating in the signal graph.
#[derive(Debug, Clone)]
pub struct Vertex {
    /// Stable identifier
    pub id: NodeId,
    /// Known position, if calibrated
    pub position: Option<Point>,
    /// True for fixed anchor nodes
    pub fixed: bool,
}

/// Last known state of one signal path.
#[derive(Debug, Clone, Default)]
pub struct EdgeState {
    /// Filtered RSSI (dBm)
    pub rssi_dbm: f64,
    /// Excess attenuation (dB)
    pub attenuation_db: f64,
    /// Confidence of the fused estimate
    pub confidence: f64,
    /// Motion detected on this path
    pub motion: bool,
    /// Last update timestamp (Unix seconds)
    pub timestamp: f64,
}

/// Arena-backed signal graph.
#[derive(Debug, Default)]
pub struct SignalGraph {
    vertices: HashMap<NodeId, Vertex>,
    edges: HashMap<PairKey, EdgeState>,
}

impl SignalGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a vertex.
    pub fn upsert_vertex(&mut self, vertex: Vertex) {
        self.vertices.insert(vertex.id.clone(), vertex);
    }

    /// Looks up a vertex.
    pub fn vertex(&self, id: &str) -> Option<&Vertex> {
        self.vertices.get(id)
    }

    /// Removes a vertex and all edges touching it.
    pub fn remove_vertex(&mut self, id: &str) {
        self.vertices.remove(id);
        self.edges.retain(|key, _| !key.contains(id));
    }

    /// Inserts or replaces an edge state.
    pub fn upsert_edge(&mut self, key: PairKey, state: EdgeState) {
        self.edges.insert(key, state);
    }

    /// Looks up an edge by its unordered endpoints.
    pub fn edge(&self, a: &str, b: &str) -> Option<&EdgeState> {
        self.edges.get(&PairKey::new(a, b))
    }

    /// Ids of all vertices adjacent to `id`.
    pub fn neighbors(&self, id: &str) -> Vec<&str> {
        self.edges
            .keys()
            .filter_map(|key| key.other(id))
            .collect()
    }

    /// All edges touching `id`.
    pub fn edges_for(&self, id: &str) -> Vec<(&PairKey, &EdgeState)> {
        self.edges
            .iter()
            .filter(|(key, _)| key.contains(id))
            .collect()
    }

    /// Iterates all edges.
    pub fn edges(&self) -> impl Iterator<Item = (&PairKey, &EdgeState)> {
        self.edges.iter()
    }

    /// Iterates all vertices.
    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.values()
    }

    /// Drops edges older than `ttl_s` relative to `now`.
    pub fn prune_stale_edges(&mut self, now: f64, ttl_s: f64) {
        self.edges.retain(|_, edge| now - edge.timestamp <= ttl_s);
    }
}
