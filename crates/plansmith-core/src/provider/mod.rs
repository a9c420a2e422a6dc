//! Model provider seam.
//!
//! A provider turns a [`ModelRequest`] into a stream of reply text chunks.
//! Network-backed providers live outside this crate; [`ReplayProvider`]
//! streams a recorded reply.

mod replay;

pub use replay::ReplayProvider;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reply text chunks, in order.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Dropped connections, rate limits, overloaded upstreams.
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    /// Estimated prompt size.
    pub num_tokens: usize,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Start streaming a reply. Errors before the first chunk are returned
    /// directly; errors mid-stream arrive as stream items.
    async fn stream_reply(&self, request: &ModelRequest) -> Result<ReplyStream, ProviderError>;
}

// Compile-time assertion: ModelProvider must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ModelProvider) {}
};

/// Delay before retry number `attempt` (1-based): exponential from `base`,
/// capped at 32x, plus up to half of `base` in jitter.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return base;
    }
    let exp = base.saturating_mul(1 << attempt.saturating_sub(1).min(5));
    let half_ms = (base.as_millis() as u64 / 2).max(1);
    exp + Duration::from_millis(rand::rng().random_range(0..half_ms))
}
