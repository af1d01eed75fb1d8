//! Combined static map, serializable to JSON on disk.
//!
//! The wall attenuation grid is stored as a base64-encoded little-endian
//! `f32` array plus its dimensions, keeping the floorplan file compact.

use std::collections::BTreeMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use senseye_common::{NodeId, Point};
use senseye_fusion::{AttenuationField, GridSpec};

use crate::topology::RoomGraph;
use crate::walls::WallSegment;

/// Floorplan persistence errors.
#[derive(Debug, Error)]
pub enum FloorPlanError {
    /// File I/O failure.
    #[error("floorplan I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed floorplan JSON.
    #[error("floorplan parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Wall grid payload inconsistent with its dimensions.
    #[error("wall grid is corrupt: {0}")]
    CorruptGrid(String),
}

/// Serialized tomography grid: base64 `f32` cells plus dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WallGrid {
    /// Base64-encoded little-endian f32 cell values, row-major
    pub data_b64: String,
    /// Number of rows (along y)
    pub rows: usize,
    /// Number of columns (along x)
    pub cols: usize,
    /// Cell edge length (meters)
    pub resolution: f64,
}

impl WallGrid {
    /// Encodes an attenuation field.
    pub fn from_field(field: &AttenuationField) -> Self {
        let (rows, cols) = field.values.shape();
        let mut bytes = Vec::with_capacity(rows * cols * 4);
        for r in 0..rows {
            for c in 0..cols {
                bytes.extend_from_slice(&(field.values[(r, c)] as f32).to_le_bytes());
            }
        }
        Self {
            data_b64: BASE64.encode(bytes),
            rows,
            cols,
            resolution: field.spec.resolution,
        }
    }

    /// Decodes the cell values, row-major.
    pub fn decode(&self) -> Result<Vec<f32>, FloorPlanError> {
        let bytes = BASE64
            .decode(&self.data_b64)
            .map_err(|e| FloorPlanError::CorruptGrid(e.to_string()))?;
        if bytes.len() != self.rows * self.cols * 4 {
            return Err(FloorPlanError::CorruptGrid(format!(
                "expected {} cells, got {} bytes",
                self.rows * self.cols,
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}

/// Static floorplan: node layout, walls, rooms, and calibration baselines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloorPlan {
    /// Calibrated node positions
    pub node_positions: BTreeMap<NodeId, Point>,
    /// Inferred wall segments
    pub walls: Vec<WallSegment>,
    /// Room topology
    pub rooms: RoomGraph,
    /// Imaged bounds `(x_min, y_min, x_max, y_max)`
    pub bounds: (f64, f64, f64, f64),
    /// Display labels for nodes, devices and rooms
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Tomography grid snapshot, if one was reconstructed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_grid: Option<WallGrid>,
    /// Per-device mean RSSI at calibration time, for drift checks
    #[serde(default)]
    pub baseline_rssi: BTreeMap<NodeId, f64>,
    /// Calibration wall-clock timestamp (Unix seconds)
    pub built_at: f64,
}

impl FloorPlan {
    /// Grid spec matching the floorplan bounds at `resolution`.
    pub fn grid_spec(&self, resolution: f64) -> GridSpec {
        GridSpec::new(self.bounds, resolution)
    }

    /// Seconds elapsed since calibration.
    pub fn age(&self, now: f64) -> f64 {
        (now - self.built_at).max(0.0)
    }

    /// Serializes to JSON at `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), FloorPlanError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Loads a floorplan from `path`; `Ok(None)` when the file is absent.
    pub fn load(path: &Path) -> Result<Option<FloorPlan>, FloorPlanError> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// True when any current pairwise node distance has drifted beyond
    /// `threshold` meters from the stored layout.
    ///
    /// `current` must be ordered like `sorted(node_positions.keys())`; a
    /// shape mismatch means the topology changed and also returns true.
    pub fn needs_update(&self, current: &senseye_fusion::DistanceMatrix, threshold: f64) -> bool {
        let node_ids: Vec<&NodeId> = self.node_positions.keys().collect();
        let n = node_ids.len();
        if n < 2 {
            return false;
        }
        if current.node_ids.len() != n || current.distances.shape() != (n, n) {
            return true;
        }
        for i in 0..n {
            for j in (i + 1)..n {
                let stored =
                    self.node_positions[node_ids[i]].distance_to(&self.node_positions[node_ids[j]]);
                let measured = current.distances[(i, j)];
                if measured > 0.0 && (stored - measured).abs() > threshold {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use senseye_fusion::DistanceMatrix;

    fn sample_plan() -> FloorPlan {
        let mut node_positions = BTreeMap::new();
        node_positions.insert("a".to_string(), Point::new(0.0, 0.0));
        node_positions.insert("b".to_string(), Point::new(3.0, 0.0));
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "kitchen".to_string());

        let mut field = AttenuationField::empty(GridSpec::new((0.0, 0.0, 2.0, 2.0), 1.0));
        field.values[(0, 1)] = 4.5;

        FloorPlan {
            node_positions,
            walls: vec![WallSegment {
                start: Point::new(1.0, -0.5),
                end: Point::new(1.0, 0.5),
                attenuation_db: 6.0,
                material: "wood".into(),
            }],
            rooms: RoomGraph::default(),
            bounds: (-2.0, -2.0, 5.0, 2.0),
            labels,
            wall_grid: Some(WallGrid::from_field(&field)),
            baseline_rssi: BTreeMap::from([("dev".to_string(), -60.0)]),
            built_at: 1_700_000_000.0,
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("floorplan.json");
        let plan = sample_plan();
        plan.save(&path).unwrap();
        let loaded = FloorPlan::load(&path).unwrap().unwrap();
        assert_eq!(loaded, plan);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FloorPlan::load(&dir.path().join("nope.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_wall_grid_roundtrip() {
        let mut field = AttenuationField::empty(GridSpec::new((0.0, 0.0, 3.0, 2.0), 1.0));
        field.values[(1, 2)] = 7.25;
        let grid = WallGrid::from_field(&field);
        assert_eq!(grid.rows, 2);
        assert_eq!(grid.cols, 3);
        let cells = grid.decode().unwrap();
        assert_eq!(cells.len(), 6);
        assert!((cells[1 * 3 + 2] - 7.25).abs() < 1e-6);
    }

    #[test]
    fn test_wall_grid_detects_corruption() {
        let mut grid = WallGrid {
            data_b64: BASE64.encode([0u8; 4]),
            rows: 2,
            cols: 2,
            resolution: 0.5,
        };
        assert!(grid.decode().is_err());
        grid.data_b64 = "!!!not base64!!!".into();
        assert!(grid.decode().is_err());
    }

    #[test]
    fn test_needs_update_on_drift() {
        let plan = sample_plan();
        // Matching distances: a-b is 3.0.
        let mut current = DistanceMatrix::zeros(vec!["a".into(), "b".into()]);
        current.set(0, 1, 3.2);
        assert!(!plan.needs_update(&current, 2.0));
        current.set(0, 1, 8.0);
        assert!(plan.needs_update(&current, 2.0));
    }

    #[test]
    fn test_needs_update_on_shape_mismatch() {
        let plan = sample_plan();
        let current = DistanceMatrix::zeros(vec!["a".into(), "b".into(), "c".into()]);
        assert!(plan.needs_update(&current, 2.0));
    }
}
