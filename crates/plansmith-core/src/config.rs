//! Engine tuning knobs, loadable from the `[engine]` section of the CLI
//! config file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime configuration for tell sessions and file builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on prompt tokens sent to the model. `0` disables the check.
    pub max_context_tokens: usize,
    /// Pause after a reset build streams its final progress message.
    pub reset_settle_delay_ms: u64,
    /// How long a reset waits for the active-build write lock.
    pub lock_timeout_ms: u64,
    /// Base delay before retrying a transient provider failure.
    pub retry_backoff_ms: u64,
    /// Forward raw reply chunks to the client stream.
    pub stream_reply_chunks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 120_000,
            reset_settle_delay_ms: 200,
            lock_timeout_ms: 5_000,
            retry_backoff_ms: 500,
            stream_reply_chunks: true,
        }
    }
}

impl EngineConfig {
    pub fn reset_settle_delay(&self) -> Duration {
        Duration::from_millis(self.reset_settle_delay_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
