//! Deterministic provider that streams a recorded reply.
//!
//! Used by `plansmith replay` and by tests. Failures can be scripted so
//! retry behaviour is reproducible.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{ModelProvider, ModelRequest, ProviderError, ReplyStream};

/// Stable provider name.
pub const REPLAY_PROVIDER_NAME: &str = "replay";

#[derive(Debug, Clone)]
struct ScriptedFailure {
    error: ProviderError,
    /// Chunks streamed before the error. `0` fails before the stream opens.
    after_chunks: usize,
}

#[derive(Debug)]
pub struct ReplayProvider {
    chunks: Vec<String>,
    chunk_delay: Duration,
    failures: Mutex<VecDeque<ScriptedFailure>>,
    requests: Mutex<Vec<ModelRequest>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReplayProvider {
    #[must_use]
    pub fn new(chunks: Vec<String>) -> Self {
        Self {
            chunks,
            chunk_delay: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Split `reply` into chunks of at most `chunk_size` characters.
    #[must_use]
    pub fn from_reply(reply: &str, chunk_size: usize) -> Self {
        Self::new(split_chunks(reply, chunk_size))
    }

    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Make the next unscripted call fail with `error` after streaming
    /// `after_chunks` chunks. Calls queue up in order.
    #[must_use]
    pub fn with_failure(self, error: ProviderError, after_chunks: usize) -> Self {
        lock(&self.failures).push_back(ScriptedFailure { error, after_chunks });
        self
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl ModelProvider for ReplayProvider {
    fn name(&self) -> &str {
        REPLAY_PROVIDER_NAME
    }

    async fn stream_reply(&self, request: &ModelRequest) -> Result<ReplyStream, ProviderError> {
        lock(&self.requests).push(request.clone());
        let failure = lock(&self.failures).pop_front();

        if let Some(ScriptedFailure { error, after_chunks: 0 }) = &failure {
            tracing::debug!(error = %error, "replay failing before first chunk");
            return Err(error.clone());
        }

        let chunks = self.chunks.clone();
        let delay = self.chunk_delay;
        let stream = async_stream::stream! {
            for (i, chunk) in chunks.into_iter().enumerate() {
                if let Some(f) = &failure {
                    if i == f.after_chunks {
                        yield Err(f.error.clone());
                        return;
                    }
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(chunk);
            }
            if let Some(f) = failure {
                yield Err(f.error);
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Split on character boundaries into pieces of at most `size` characters.
pub fn split_chunks(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}
