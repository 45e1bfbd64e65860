//! Balance engine configuration.

use std::time::Duration;

/// Tuning knobs for [`BalanceEngine`](crate::BalanceEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Organizations locked, aggregated and committed together.
    pub chunk_size: usize,

    /// Budget for a whole `recompute` call. Organizations not committed by
    /// then are reported as timed out and left untouched.
    pub timeout: Option<Duration>,
}

impl EngineConfig {
    pub const DEFAULT_CHUNK_SIZE: usize = 500;

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            timeout: None,
        }
    }
}
