//! Pairwise distance matrices from acoustic time-of-flight and RF ranging.
//!
//! Acoustic entries are preferred wherever present; RF estimates fill the
//! rest. Missing acoustic pairs can be recovered by bounded-hop shortest
//! paths over the known direct edges, and pairs known only through a
//! common reference node fall back to the uniform-angular prior
//! `√(d₀ᵢ² + d₀ⱼ²)`.

use std::collections::HashMap;

use nalgebra::DMatrix;

use senseye_common::NodeId;

/// Speed of sound in air at ~20 °C (m/s).
pub const SPEED_OF_SOUND: f64 = 343.0;

/// Hop cap for shortest-path completion of missing acoustic pairs.
pub const MAX_COMPLETION_HOPS: usize = 3;

/// Symmetric pairwise distance matrix over an ordered node list.
///
/// Unmeasured pairs hold `0.0` (off-diagonal zero means "unknown").
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    /// Ordered node ids defining row/column order
    pub node_ids: Vec<NodeId>,
    /// `n × n` distances in meters
    pub distances: DMatrix<f64>,
}

impl DistanceMatrix {
    /// Creates an all-zero matrix over `node_ids`.
    pub fn zeros(node_ids: Vec<NodeId>) -> Self {
        let n = node_ids.len();
        Self {
            node_ids,
            distances: DMatrix::zeros(n, n),
        }
    }

    /// Builds a matrix from time-of-flight measurements in seconds.
    ///
    /// Pairs mentioned in `tof` but absent from `node_ids` are ignored.
    pub fn from_tof(
        tof: &HashMap<(NodeId, NodeId), f64>,
        node_ids: Vec<NodeId>,
    ) -> Self {
        let mut matrix = Self::zeros(node_ids);
        let index: HashMap<&str, usize> = matrix
            .node_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        for ((src, tgt), &tof_s) in tof {
            let (Some(&i), Some(&j)) = (index.get(src.as_str()), index.get(tgt.as_str())) else {
                continue;
            };
            if i == j || tof_s <= 0.0 {
                continue;
            }
            let d = tof_s * SPEED_OF_SOUND;
            matrix.distances[(i, j)] = d;
            matrix.distances[(j, i)] = d;
        }
        matrix
    }

    /// Sets a symmetric entry by index.
    pub fn set(&mut self, i: usize, j: usize, distance: f64) {
        self.distances[(i, j)] = distance;
        self.distances[(j, i)] = distance;
    }

    /// Known (non-zero) entry lookup.
    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        let d = self.distances[(i, j)];
        (i == j || d > 0.0).then_some(d)
    }

    /// Merges acoustic and RF matrices, preferring acoustic where present.
    ///
    /// Both matrices must share the node ordering.
    pub fn merge(acoustic: &DistanceMatrix, rf: &DistanceMatrix) -> DistanceMatrix {
        debug_assert_eq!(acoustic.node_ids, rf.node_ids);
        let mut merged = acoustic.clone();
        let n = merged.node_ids.len();
        for i in 0..n {
            for j in 0..n {
                if merged.distances[(i, j)] <= 0.0 {
                    merged.distances[(i, j)] = rf.distances[(i, j)];
                }
            }
        }
        merged
    }

    /// Fills missing pairs by shortest paths over known direct edges,
    /// bounded to `max_hops` edges per path.
    ///
    /// A triangle-inequality upper bound: good enough to seed MDS when a
    /// direct chirp between two nodes failed but both heard a relay.
    pub fn complete_bounded_hops(&mut self, max_hops: usize) {
        let n = self.node_ids.len();
        if n == 0 {
            return;
        }
        // Bellman-Ford bounded to max_hops edges: each round extends the
        // best known paths by exactly one direct edge.
        let mut direct = vec![vec![f64::INFINITY; n]; n];
        for i in 0..n {
            for j in 0..n {
                let d = self.distances[(i, j)];
                if i != j && d > 0.0 {
                    direct[i][j] = d;
                }
            }
        }
        let mut best = direct.clone();
        for _ in 2..=max_hops {
            let prev = best.clone();
            for i in 0..n {
                for j in 0..n {
                    if i == j {
                        continue;
                    }
                    for k in 0..n {
                        let via = prev[i][k] + direct[k][j];
                        if via < best[i][j] {
                            best[i][j] = via;
                        }
                    }
                }
            }
        }
        for i in 0..n {
            for j in 0..n {
                if i != j && self.distances[(i, j)] <= 0.0 && best[i][j].is_finite() {
                    self.distances[(i, j)] = best[i][j];
                }
            }
        }
    }

    /// Fills remaining unknown pairs from distances to the reference node
    /// at row 0 using the uniform-angular prior `√(d₀ᵢ² + d₀ⱼ²)`,
    /// capped at `max_distance`.
    pub fn fill_angular_prior(&mut self, max_distance: f64) {
        let n = self.node_ids.len();
        for i in 1..n {
            for j in (i + 1)..n {
                if self.distances[(i, j)] > 0.0 {
                    continue;
                }
                let di = self.distances[(0, i)];
                let dj = self.distances[(0, j)];
                if di <= 0.0 || dj <= 0.0 {
                    continue;
                }
                let dij = di.hypot(dj).min(max_distance);
                self.set(i, j, dij);
            }
        }
    }
}
