//! Tell sessions: send a prompt with plan context to the model, stream the
//! reply to the client, and turn the reply's file operations into builds.
//!
//! A session owns the reply phase only. Builds run on the [`Builder`]'s
//! per-path workers and may still be running when the session's task
//! returns; the plan's `done` token fires once both have drained.

mod context;
mod prompts;

pub use context::{
    format_model_context, ContextOptions, FormattedContext, APPLY_SCRIPT_PATH, CONTEXT_FOOTER,
    CONTEXT_HEADER,
};
pub use prompts::{build_request, system_prompt};

use std::sync::Arc;

use anyhow::anyhow;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use plansmith_db::models::PlanStatus;

use crate::active::{ActiveBuild, ActivePlanRegistry, PlanKey, PlanSubscription};
use crate::build::{Builder, ReferenceMerge, StructuredEdits};
use crate::config::EngineConfig;
use crate::provider::{retry_delay, ModelProvider, ModelRequest, ProviderError};
use crate::reply::{ChunkProcessor, Operation};
use crate::store::{PlanStore, TellState};
use crate::stream::{BuildInfo, StreamMessage};
use crate::tokens;

/// Retries after the first failed reply stream.
pub const NUM_TELL_STREAM_RETRIES: u32 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TellStage {
    Context,
    #[default]
    Planning,
    /// Working on the current subtask; file context is limited to the files
    /// it uses.
    Implementation,
}

#[derive(Debug, Clone)]
pub struct TellRequest {
    pub plan_id: Uuid,
    pub branch: String,
    pub prompt: String,
    pub stage: TellStage,
    pub include_maps: bool,
    pub include_trees: bool,
    pub exec_enabled: bool,
    /// Queue builds for the reply's operations. When `false` the reply is
    /// stored with its operations pending.
    pub auto_build: bool,
}

impl TellRequest {
    pub fn new(plan_id: Uuid, branch: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            plan_id,
            branch: branch.into(),
            prompt: prompt.into(),
            stage: TellStage::default(),
            include_maps: false,
            include_trees: false,
            exec_enabled: false,
            auto_build: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TellError {
    #[error("plan {0} already has an active session")]
    AlreadyActive(PlanKey),

    #[error("plan {0} not found")]
    PlanNotFound(Uuid),

    #[error("prompt needs {tokens} tokens but the limit is {max}")]
    ContextTooLarge { tokens: usize, max: usize },

    #[error("reply stream failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ProviderError },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("tell session was stopped")]
    Stopped,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Result of a session's reply phase.
#[derive(Debug, Clone)]
pub struct TellOutcome {
    pub reply_id: Uuid,
    pub reply: String,
    pub operations: Vec<Operation>,
    /// Stream attempts used, including the successful one.
    pub attempts: u32,
    pub queued_builds: usize,
    pub prompt_tokens: usize,
}

/// Client side of a running tell session.
#[derive(Debug)]
pub struct TellHandle {
    pub key: PlanKey,
    pub messages: mpsc::UnboundedReceiver<StreamMessage>,
    pub done: CancellationToken,
    task: JoinHandle<Result<TellOutcome, TellError>>,
}

impl TellHandle {
    fn new(subscription: PlanSubscription, task: JoinHandle<Result<TellOutcome, TellError>>) -> Self {
        Self {
            key: subscription.key,
            messages: subscription.messages,
            done: subscription.done,
            task,
        }
    }

    /// Wait for the reply phase and every build to finish, returning the
    /// session result and all messages streamed for the plan.
    pub async fn wait(mut self) -> (Result<TellOutcome, TellError>, Vec<StreamMessage>) {
        let result = match (&mut self.task).await {
            Ok(result) => result,
            Err(err) => Err(TellError::Internal(anyhow!("tell session task failed: {err}"))),
        };
        self.done.cancelled().await;

        let mut messages = Vec::new();
        while let Ok(message) = self.messages.try_recv() {
            messages.push(message);
        }
        (result, messages)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Entry point for starting, building and stopping plans.
pub struct Orchestrator {
    registry: Arc<ActivePlanRegistry>,
    builder: Arc<Builder>,
    store: Arc<dyn PlanStore>,
    provider: Arc<dyn ModelProvider>,
    config: EngineConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("provider", &self.provider.name())
            .field("active_plans", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(store: Arc<dyn PlanStore>, provider: Arc<dyn ModelProvider>, config: EngineConfig) -> Self {
        Self::with_edits(store, provider, Arc::new(ReferenceMerge), config)
    }

    pub fn with_edits(
        store: Arc<dyn PlanStore>,
        provider: Arc<dyn ModelProvider>,
        edits: Arc<dyn StructuredEdits>,
        config: EngineConfig,
    ) -> Self {
        let registry = Arc::new(ActivePlanRegistry::new());
        let builder = Builder::new(Arc::clone(&registry), Arc::clone(&store), edits, &config);
        Self {
            registry,
            builder,
            store,
            provider,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ActivePlanRegistry> {
        &self.registry
    }

    pub fn builder(&self) -> &Arc<Builder> {
        &self.builder
    }

    /// Start a tell session. The plan must exist and must not already be
    /// active.
    pub async fn start_tell(&self, request: TellRequest) -> Result<TellHandle, TellError> {
        let key = PlanKey::new(request.plan_id, request.branch.clone());
        let state = self
            .store
            .load_tell_state(request.plan_id, &request.branch)
            .await?
            .ok_or(TellError::PlanNotFound(request.plan_id))?;

        let subscription = self
            .registry
            .create(key.clone(), &state.contexts, true)
            .map_err(|_| TellError::AlreadyActive(key.clone()))?;
        let cancel = self
            .registry
            .update(&key, |plan| plan.cancel.clone())
            .unwrap_or_default();

        tracing::info!(plan = %key, stage = ?request.stage, provider = self.provider.name(), "starting tell");

        let session = TellSession {
            key,
            request,
            state,
            store: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider),
            builder: Arc::clone(&self.builder),
            config: self.config.clone(),
            cancel,
        };
        let task = tokio::spawn(session.run());
        Ok(TellHandle::new(subscription, task))
    }

    /// Stop an active plan: cancel its reply stream, drop queued builds and
    /// mark the branch stopped. Returns `false` if the plan was not active.
    pub async fn stop(&self, plan_id: Uuid, branch: &str) -> bool {
        let key = PlanKey::new(plan_id, branch);
        let stopped = self
            .builder
            .abort_plan(&key, PlanStatus::Stopped, Some(StreamMessage::Stopped), None)
            .await;
        if stopped {
            tracing::info!(plan = %key, "plan stopped");
        }
        stopped
    }

    /// Build stored replies that have not been built yet.
    pub async fn build_pending(
        &self,
        plan_id: Uuid,
        branch: &str,
    ) -> anyhow::Result<(usize, PlanSubscription)> {
        self.builder.build_pending(plan_id, branch).await
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct TellSession {
    key: PlanKey,
    request: TellRequest,
    state: TellState,
    store: Arc<dyn PlanStore>,
    provider: Arc<dyn ModelProvider>,
    builder: Arc<Builder>,
    config: EngineConfig,
    cancel: CancellationToken,
}

struct AttemptReply {
    text: String,
    operations: Vec<Operation>,
}

enum AttemptError {
    Provider(ProviderError),
    Stopped,
}

impl From<ProviderError> for AttemptError {
    fn from(err: ProviderError) -> Self {
        AttemptError::Provider(err)
    }
}

impl TellSession {
    async fn run(self) -> Result<TellOutcome, TellError> {
        let result = self.execute().await;
        if let Err(err) = &result {
            self.fail(err).await;
        }
        result
    }

    async fn execute(&self) -> Result<TellOutcome, TellError> {
        let key = &self.key;
        self.store
            .set_plan_status(key.plan_id, &key.branch, PlanStatus::Replying, None)
            .await?;

        let subtask = match self.request.stage {
            TellStage::Implementation => self.state.current_subtask(),
            _ => None,
        };
        let context = format_model_context(
            &self.state.contexts,
            &self.state.current_files,
            &ContextOptions {
                include_maps: self.request.include_maps,
                include_trees: self.request.include_trees,
                exec_enabled: self.request.exec_enabled,
                subtask,
            },
        );
        let request = build_request(
            self.request.stage,
            &context.text,
            &self.state.convo,
            &self.request.prompt,
        );

        let max = self.config.max_context_tokens;
        if max > 0 && request.num_tokens > max {
            return Err(TellError::ContextTooLarge {
                tokens: request.num_tokens,
                max,
            });
        }
        tracing::info!(
            plan = %key,
            prompt_tokens = request.num_tokens,
            context_tokens = context.num_tokens,
            "sending prompt"
        );

        self.store
            .add_user_message(
                key.plan_id,
                &key.branch,
                &self.request.prompt,
                tokens::estimate(&self.request.prompt),
            )
            .await?;

        let (reply, attempts) = self.stream_with_retries(&request).await?;
        if self.cancel.is_cancelled() {
            return Err(TellError::Stopped);
        }

        let message = self
            .store
            .add_reply(
                key.plan_id,
                &key.branch,
                &reply.text,
                tokens::estimate(&reply.text),
                &reply.operations,
            )
            .await?;

        let mut queued_builds = 0;
        if self.request.auto_build && !reply.operations.is_empty() {
            self.store
                .set_plan_status(key.plan_id, &key.branch, PlanStatus::Building, None)
                .await?;
            let plan_build = self
                .store
                .create_plan_build(key.plan_id, &key.branch, message.id)
                .await?;
            let builds = reply
                .operations
                .iter()
                .map(|op| ActiveBuild::from_operation(op, message.id, Some(plan_build.id)));
            queued_builds = self.builder.queue_builds(key, builds);
            if queued_builds == reply.operations.len() {
                self.store.mark_reply_built(message.id).await?;
            } else {
                tracing::warn!(
                    plan = %key,
                    queued_builds,
                    operations = reply.operations.len(),
                    "plan stopped while queueing, reply left for a later build"
                );
            }
        }
        tracing::info!(
            plan = %key,
            operations = reply.operations.len(),
            queued_builds,
            attempts,
            "reply complete"
        );

        self.builder
            .registry()
            .update(key, |plan| plan.reply_streaming = false);
        self.builder.finish_if_drained(key).await;

        Ok(TellOutcome {
            reply_id: message.id,
            reply: reply.text,
            operations: reply.operations,
            attempts,
            queued_builds,
            prompt_tokens: request.num_tokens,
        })
    }

    /// Stream the reply, restarting from scratch on transient failures.
    /// Operations are only kept from the attempt that completes.
    async fn stream_with_retries(&self, request: &ModelRequest) -> Result<(AttemptReply, u32), TellError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.stream_attempt(request).await {
                Ok(reply) => return Ok((reply, attempt)),
                Err(AttemptError::Stopped) => return Err(TellError::Stopped),
                Err(AttemptError::Provider(err)) => err,
            };

            if !err.is_retryable() {
                return Err(TellError::Provider(err));
            }
            if attempt > NUM_TELL_STREAM_RETRIES {
                return Err(TellError::RetriesExhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = retry_delay(self.config.retry_backoff(), attempt);
            tracing::warn!(
                plan = %self.key,
                attempt,
                max_retries = NUM_TELL_STREAM_RETRIES,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "reply stream failed, retrying"
            );
            self.builder.stream(
                &self.key,
                StreamMessage::Retrying {
                    attempt,
                    error: err.to_string(),
                },
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TellError::Stopped),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn stream_attempt(&self, request: &ModelRequest) -> Result<AttemptReply, AttemptError> {
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(AttemptError::Stopped),
            stream = self.provider.stream_reply(request) => stream?,
        };

        let mut processor = ChunkProcessor::new();
        let mut text = String::new();
        let mut operations = Vec::new();
        let mut last_progress: Option<(String, usize)> = None;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(AttemptError::Stopped),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            text.push_str(&chunk);
            operations.extend(processor.feed(&chunk));
            if self.config.stream_reply_chunks {
                self.builder
                    .stream(&self.key, StreamMessage::Reply { chunk });
            }

            if let Some((path, num_tokens)) = processor.open_file() {
                let changed = last_progress
                    .as_ref()
                    .is_none_or(|(p, t)| p != path || *t != num_tokens);
                if changed {
                    self.builder.stream(
                        &self.key,
                        StreamMessage::BuildInfo(BuildInfo::progress(path, num_tokens)),
                    );
                    last_progress = Some((path.to_string(), num_tokens));
                }
            }
        }

        if let Some(discarded) = processor.finish() {
            tracing::warn!(plan = %self.key, construct = %discarded, "reply ended inside an open block");
        }
        Ok(AttemptReply { text, operations })
    }

    async fn fail(&self, err: &TellError) {
        let message = err.to_string();
        let aborted = self
            .builder
            .abort_plan(
                &self.key,
                PlanStatus::Error,
                Some(StreamMessage::Error {
                    path: None,
                    message: message.clone(),
                }),
                Some(&message),
            )
            .await;
        if aborted {
            tracing::error!(plan = %self.key, error = %message, "tell session failed");
        }
    }
}
