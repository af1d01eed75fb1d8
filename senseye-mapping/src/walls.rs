//! Wall inference from excess RF attenuation.
//!
//! Two candidate sources: per-link segments placed perpendicular to the
//! link at its midpoint, and peak cells of the tomographic reconstruction.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use senseye_common::{NodeId, PairKey, Point};
use senseye_fusion::AttenuationField;

/// Wall half-length per dB of attenuation (meters).
const LENGTH_PER_DB: f64 = 0.15;

/// Cap on segments extracted from one tomography field.
const MAX_FIELD_SEGMENTS: usize = 40;

/// An inferred wall segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WallSegment {
    /// Segment start
    pub start: Point,
    /// Segment end
    pub end: Point,
    /// Attenuation attributed to the obstruction (dB)
    pub attenuation_db: f64,
    /// Coarse material class
    pub material: String,
}

/// Classifies wall material from attenuation in dB.
pub fn classify_material(attenuation_db: f64) -> &'static str {
    if attenuation_db < 3.0 {
        "open"
    } else if attenuation_db < 5.0 {
        "drywall"
    } else if attenuation_db < 8.0 {
        "wood"
    } else if attenuation_db < 12.0 {
        "brick"
    } else {
        "concrete"
    }
}

/// Detects wall segments from node positions and per-link attenuations.
///
/// Each link at or above `threshold_db` contributes a segment perpendicular
/// to the link at its midpoint, with length proportional to attenuation.
pub fn detect_walls(
    node_positions: &BTreeMap<NodeId, Point>,
    link_attenuations: &BTreeMap<PairKey, f64>,
    threshold_db: f64,
) -> Vec<WallSegment> {
    let mut walls = Vec::new();

    for (pair, &attenuation_db) in link_attenuations {
        if attenuation_db < threshold_db {
            continue;
        }
        let (Some(pa), Some(pb)) = (
            node_positions.get(pair.first()),
            node_positions.get(pair.second()),
        ) else {
            continue;
        };

        let mid = Point::new((pa.x + pb.x) / 2.0, (pa.y + pb.y) / 2.0);
        let dx = pb.x - pa.x;
        let dy = pb.y - pa.y;
        let link_len = dx.hypot(dy);
        if link_len < 1e-12 {
            continue;
        }

        // Perpendicular unit vector.
        let perp = Point::new(-dy / link_len, dx / link_len);
        let half_len = attenuation_db * LENGTH_PER_DB;

        walls.push(WallSegment {
            start: Point::new(mid.x - perp.x * half_len, mid.y - perp.y * half_len),
            end: Point::new(mid.x + perp.x * half_len, mid.y + perp.y * half_len),
            attenuation_db,
            material: classify_material(attenuation_db).to_string(),
        });
    }

    walls
}

/// Extracts wall candidates from tomography peaks.
///
/// Peak cells at or above `threshold_db` (after thinning to local maxima)
/// become short horizontal segments at the cell center.
pub fn walls_from_field(field: &AttenuationField, threshold_db: f64) -> Vec<WallSegment> {
    let half = field.spec.resolution * 0.45;
    field
        .peaks(threshold_db)
        .into_iter()
        .take(MAX_FIELD_SEGMENTS)
        .map(|(row, col, value)| {
            let center = field.spec.cell_center(row, col);
            WallSegment {
                start: Point::new(center.x - half, center.y),
                end: Point::new(center.x + half, center.y),
                attenuation_db: value,
                material: classify_material(value).to_string(),
            }
        })
        .collect()
}

/// Drops duplicate segments (same rounded endpoints and material).
pub fn dedupe_walls(walls: Vec<WallSegment>) -> Vec<WallSegment> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for wall in walls {
        let quantize = |p: &Point| ((p.x * 100.0).round() as i64, (p.y * 100.0).round() as i64);
        let (mut s, mut e) = (quantize(&wall.start), quantize(&wall.end));
        if s > e {
            std::mem::swap(&mut s, &mut e);
        }
        if seen.insert((s, e, wall.material.clone())) {
            unique.push(wall);
        }
    }
    unique
}
