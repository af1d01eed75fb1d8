//! senseye node agent
//!
//! Every participating device runs this identical agent: it scans RF and
//! optional acoustic signals, filters each signal path through an adaptive
//! Kalman bank, infers link/device/zone beliefs, gossips them across the
//! TCP mesh, fuses its own view with peer beliefs, and maintains a shared
//! floorplan with a live motion overlay.
//!
//! Pipeline: SCAN → FILTER → INFER → SHARE ↔ FUSE → WORLD → RENDER.

pub mod acoustic;
pub mod calibration;
pub mod filter;
pub mod inference;
pub mod mesh;
pub mod pipeline;
pub mod registry;
pub mod scanner;
pub mod tasks;

pub use acoustic::{AcousticDevice, AcousticError};
pub use calibration::{calibrate, CalibrationError, CalibrationInputs};
pub use filter::{FilterBank, FilterOutput, PathState};
pub use inference::{distance_from_rssi, expected_rssi, infer, InferenceContext, ZoneSpec};
pub use mesh::{process_belief, DedupTable, MeshCommand, MeshEvent, MeshTask, RelayDecision};
pub use pipeline::{PipelineMessage, PipelineTask};
pub use registry::{DiscoveryEvent, ServiceRegistry, StaticRegistry};
pub use scanner::{ReplayScanner, ScanError, Scanner};
pub use tasks::{NodeTaskBase, NodeTaskChannels, TaskHandle, TaskMessage};
