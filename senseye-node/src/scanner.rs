//! Scanner collaborator contract.
//!
//! Platform-specific WiFi/BLE acquisition lives outside the core; the
//! pipeline only consumes batches of timestamped measurements with
//! per-path non-decreasing timestamps.

use async_trait::async_trait;
use thiserror::Error;

use senseye_common::Measurement;

/// Scanner failures.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The platform scanner is missing or refused to run.
    #[error("scanner unavailable: {0}")]
    Unavailable(String),

    /// A scan attempt failed; the caller should retry next cycle.
    #[error("scan failed: {0}")]
    Failed(String),
}

/// Yields measurement batches, one per pipeline cycle.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Runs one scan round and returns its observations.
    ///
    /// Timestamps must be non-decreasing per `(source, target)` path.
    async fn scan(&mut self) -> Result<Vec<Measurement>, ScanError>;
}

/// Scanner that replays pre-recorded batches; ends with empty batches.
///
/// Used by tests and by headless demo runs without radio hardware.
#[derive(Debug, Default)]
pub struct ReplayScanner {
    batches: std::collections::VecDeque<Vec<Measurement>>,
}

impl ReplayScanner {
    /// Creates a replay scanner over the given batches.
    pub fn new(batches: Vec<Vec<Measurement>>) -> Self {
        Self {
            batches: batches.into(),
        }
    }

    /// Remaining batches.
    pub fn remaining(&self) -> usize {
        self.batches.len()
    }
}

#[async_trait]
impl Scanner for ReplayScanner {
    async fn scan(&mut self) -> Result<Vec<Measurement>, ScanError> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }
}
