//! Error types for senseye

use thiserror::Error;

/// Error types shared across the senseye crates.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire protocol errors.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Network and file I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}
