//! Static floorplan construction and dynamic world state
//!
//! The static layer (node layout, walls, rooms) is produced by
//! calibration and consumed read-only at runtime; the dynamic layer
//! (motion intensities, tracked devices) is refreshed every fusion cycle.

pub mod devices;
pub mod floorplan;
pub mod layout;
pub mod motion;
pub mod topology;
pub mod walls;
pub mod world;

pub use devices::{DeviceTracker, TrackedDevice};
pub use floorplan::{FloorPlan, FloorPlanError, WallGrid};
pub use layout::{apply_anchors, mds_positions};
pub use motion::MotionState;
pub use topology::{infer_rooms_from_nodes, update_topology, Doorway, Room, RoomGraph};
pub use walls::{classify_material, dedupe_walls, detect_walls, walls_from_field, WallSegment};
pub use world::{
    update_world, CalibrationStatus, NodeHealth, RecalibrationPolicy, WorldSnapshot, WorldState,
};
