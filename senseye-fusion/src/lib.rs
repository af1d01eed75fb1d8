//! Uncertainty-aware fusion core for the senseye mesh
//!
//! All components share a single numerical contract: a confidence
//! `c ∈ (0,1)` maps to the variance `(1−c)/c + ε`, so inverse-variance
//! weighting can combine any mixture of local and remote estimates.
//! Every matrix inversion has a fallback path; singular inputs degrade
//! the result instead of raising.

pub mod confidence;
pub mod consensus;
pub mod graph;
pub mod ranging;
pub mod tomography;
pub mod trilateration;

pub use confidence::{clamp_confidence, precision, variance, WeightedMean};
pub use consensus::fuse_beliefs;
pub use graph::{EdgeState, SignalGraph, Vertex};
pub use ranging::{DistanceMatrix, SPEED_OF_SOUND};
pub use tomography::{
    AttenuationField, GridSpec, LinkSample, TomographyError, reconstruct,
};
pub use trilateration::{trilaterate, PositionFix, RangeObservation, TrilaterationError};
