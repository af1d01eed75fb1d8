//! Room topology: connectivity partitions of the walled node graph.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use senseye_common::{NodeId, Point};

use crate::walls::WallSegment;

/// A room: a cluster of nodes with no wall between any pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    /// Stable room name (`room_<n>`)
    pub name: String,
    /// Mean position of the member nodes
    pub center: Point,
    /// Member node ids
    pub node_ids: Vec<NodeId>,
}

/// A doorway between two rooms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doorway {
    /// First room name
    pub room_a: String,
    /// Second room name
    pub room_b: String,
    /// Estimated doorway position, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
}

/// Rooms and their doorway connections.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoomGraph {
    /// Rooms in construction order
    pub rooms: Vec<Room>,
    /// Doorway connections
    pub doorways: Vec<Doorway>,
}

impl RoomGraph {
    /// Name of the room containing `node_id`, if any.
    pub fn room_of(&self, node_id: &str) -> Option<&str> {
        self.rooms
            .iter()
            .find(|room| room.node_ids.iter().any(|id| id.as_str() == node_id))
            .map(|room| room.name.as_str())
    }

    /// Room whose center is nearest to `position`.
    pub fn nearest_room(&self, position: Point) -> Option<&Room> {
        self.rooms.iter().min_by(|a, b| {
            a.center
                .distance_to(&position)
                .total_cmp(&b.center.distance_to(&position))
        })
    }
}

fn segments_intersect(p1: Point, p2: Point, p3: Point, p4: Point) -> bool {
    let d1 = Point::new(p2.x - p1.x, p2.y - p1.y);
    let d2 = Point::new(p4.x - p3.x, p4.y - p3.y);
    let cross = d1.x * d2.y - d1.y * d2.x;
    if cross.abs() < 1e-12 {
        return false; // parallel
    }
    let t = ((p3.x - p1.x) * d2.y - (p3.y - p1.y) * d2.x) / cross;
    let u = ((p3.x - p1.x) * d1.y - (p3.y - p1.y) * d1.x) / cross;
    (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u)
}

fn wall_between(a: Point, b: Point, walls: &[WallSegment]) -> bool {
    walls
        .iter()
        .any(|wall| segments_intersect(a, b, wall.start, wall.end))
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, x: usize, y: usize) {
        let (rx, ry) = (self.find(x), self.find(y));
        if rx != ry {
            self.parent[rx] = ry;
        }
    }
}

/// Clusters nodes into rooms: nodes with no wall between them share a room.
///
/// Doorways connect each room pair through its closest cross-room node
/// pair (a wall separates them, but proximity suggests a passage).
pub fn infer_rooms_from_nodes(
    node_positions: &BTreeMap<NodeId, Point>,
    walls: &[WallSegment],
) -> RoomGraph {
    let node_ids: Vec<&NodeId> = node_positions.keys().collect();
    let n = node_ids.len();
    if n == 0 {
        return RoomGraph::default();
    }

    let mut uf = UnionFind::new(n);
    for i in 0..n {
        for j in (i + 1)..n {
            let pi = node_positions[node_ids[i]];
            let pj = node_positions[node_ids[j]];
            if !wall_between(pi, pj, walls) {
                uf.union(i, j);
            }
        }
    }

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        let root = uf.find(i);
        clusters.entry(root).or_default().push(i);
    }

    let mut rooms = Vec::new();
    let mut room_of_node: BTreeMap<&NodeId, String> = BTreeMap::new();
    for (idx, members) in clusters.values().enumerate() {
        let name = format!("room_{idx}");
        let mut cx = 0.0;
        let mut cy = 0.0;
        let mut ids = Vec::new();
        for &m in members {
            let p = node_positions[node_ids[m]];
            cx += p.x;
            cy += p.y;
            ids.push(node_ids[m].clone());
            room_of_node.insert(node_ids[m], name.clone());
        }
        let count = members.len() as f64;
        rooms.push(Room {
            name,
            center: Point::new(cx / count, cy / count),
            node_ids: ids,
        });
    }

    // Closest cross-room node pair per room pair becomes a doorway.
    let mut best_pair: BTreeMap<(String, String), (f64, Point)> = BTreeMap::new();
    for i in 0..n {
        for j in (i + 1)..n {
            let ra = &room_of_node[node_ids[i]];
            let rb = &room_of_node[node_ids[j]];
            if ra == rb {
                continue;
            }
            let key = if ra < rb {
                (ra.clone(), rb.clone())
            } else {
                (rb.clone(), ra.clone())
            };
            let pi = node_positions[node_ids[i]];
            let pj = node_positions[node_ids[j]];
            let dist = pi.distance_to(&pj);
            let mid = Point::new((pi.x + pj.x) / 2.0, (pi.y + pj.y) / 2.0);
            match best_pair.get(&key) {
                Some((best, _)) if *best <= dist => {}
                _ => {
                    best_pair.insert(key, (dist, mid));
                }
            }
        }
    }

    let doorways = best_pair
        .into_iter()
        .map(|((room_a, room_b), (_, mid))| Doorway {
            room_a,
            room_b,
            position: Some(mid),
        })
        .collect();

    RoomGraph { rooms, doorways }
}

/// Minimum traversals before a zone pair counts as connected.
const DOORWAY_TRAVERSALS: usize = 3;

/// Adds doorways for zone pairs with repeated observed motion traversals.
///
/// `motion_events` are `(from_zone, to_zone, timestamp)` transitions.
pub fn update_topology(graph: &RoomGraph, motion_events: &[(String, String, f64)]) -> RoomGraph {
    let mut counts: BTreeMap<(String, String), usize> = BTreeMap::new();
    for (from, to, _) in motion_events {
        if from == to {
            continue;
        }
        let key = if from < to {
            (from.clone(), to.clone())
        } else {
            (to.clone(), from.clone())
        };
        *counts.entry(key).or_insert(0) += 1;
    }

    let mut existing: std::collections::HashSet<(String, String)> = graph
        .doorways
        .iter()
        .map(|d| {
            if d.room_a < d.room_b {
                (d.room_a.clone(), d.room_b.clone())
            } else {
                (d.room_b.clone(), d.room_a.clone())
            }
        })
        .collect();

    let room_names: std::collections::HashSet<&str> =
        graph.rooms.iter().map(|r| r.name.as_str()).collect();

    let mut doorways = graph.doorways.clone();
    for (pair, count) in counts {
        if count >= DOORWAY_TRAVERSALS
            && !existing.contains(&pair)
            && room_names.contains(pair.0.as_str())
            && room_names.contains(pair.1.as_str())
        {
            doorways.push(Doorway {
                room_a: pair.0.clone(),
                room_b: pair.1.clone(),
                position: None,
            });
            existing.insert(pair);
        }
    }

    RoomGraph {
        rooms: graph.rooms.clone(),
        doorways,
    }
}
