//! Common types and utilities for senseye
//!
//! This crate provides shared types, configuration structures, and utilities
//! used across all senseye crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{
    load_and_validate_config, parse_acoustic_arg, parse_interval, AcousticConfig, AcousticMode,
    FilterConfig, FusionConfig, InferenceConfig, MappingConfig, MeshConfig, NodeRole,
    SenseyeConfig, WorldConfig,
};
pub use error::Error;
pub use logging::{init_logging, init_logging_with_filter, LogLevel};
pub use types::{now_ts, Measurement, NodeId, PairKey, Point, SignalKind};
