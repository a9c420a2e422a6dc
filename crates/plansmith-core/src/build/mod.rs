//! Per-path build queues.
//!
//! Each path of an active plan has a FIFO queue of [`ActiveBuild`]s and at
//! most one worker task draining it. Builds for different paths run
//! concurrently; builds for the same path run strictly in queue order.

mod edits;
mod exec;

pub use edits::{ReferenceMerge, StructuredEdits};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use uuid::Uuid;

use plansmith_db::models::PlanStatus;

use crate::active::{ActiveBuild, ActivePlanRegistry, PlanKey, PlanSubscription};
use crate::config::EngineConfig;
use crate::store::PlanStore;
use crate::stream::StreamMessage;

/// Failure of a single file build. Reported on the stream for its path;
/// other builds keep going.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("plan {0} is no longer active")]
    PlanNotActive(PlanKey),

    #[error("no known content for {0}")]
    FileNotFound(String),

    #[error("move from {path} failed: {reason}")]
    MoveSource { path: String, reason: String },

    #[error("timed out waiting for the build lock")]
    LockTimeout,

    #[error("failed to persist build result: {0:#}")]
    Store(anyhow::Error),

    #[error("failed to apply edits: {0:#}")]
    Edit(anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BuildTiming {
    pub(crate) reset_settle_delay: Duration,
    pub(crate) lock_timeout: Duration,
}

/// Schedules and runs file builds for active plans.
pub struct Builder {
    registry: Arc<ActivePlanRegistry>,
    store: Arc<dyn PlanStore>,
    edits: Arc<dyn StructuredEdits>,
    timing: BuildTiming,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("active_plans", &self.registry.len())
            .field("timing", &self.timing)
            .finish()
    }
}

impl Builder {
    pub fn new(
        registry: Arc<ActivePlanRegistry>,
        store: Arc<dyn PlanStore>,
        edits: Arc<dyn StructuredEdits>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            edits,
            timing: BuildTiming {
                reset_settle_delay: config.reset_settle_delay(),
                lock_timeout: config.lock_timeout(),
            },
        })
    }

    pub fn registry(&self) -> &Arc<ActivePlanRegistry> {
        &self.registry
    }

    /// Append `build` to its path's queue, starting a worker for the path if
    /// none is running. A move also claims its slot in the destination queue.
    /// Returns `false` if the plan is not active.
    pub fn queue_build(self: &Arc<Self>, key: &PlanKey, build: ActiveBuild) -> bool {
        let path = build.path.clone();
        let Some(started) = self.registry.update(key, |plan| plan.enqueue_operation(build)) else {
            tracing::warn!(plan = %key, path = %path, "dropping build for inactive plan");
            return false;
        };

        if started.is_empty() {
            tracing::debug!(plan = %key, path = %path, "queued behind running build");
        }
        for path in started {
            tracing::debug!(plan = %key, path = %path, "starting build worker");
            let builder = Arc::clone(self);
            let key = key.clone();
            tokio::spawn(async move { builder.run_path_worker(key, path).await });
        }
        true
    }

    pub fn queue_builds(
        self: &Arc<Self>,
        key: &PlanKey,
        builds: impl IntoIterator<Item = ActiveBuild>,
    ) -> usize {
        let mut queued = 0;
        for build in builds {
            if self.queue_build(key, build) {
                queued += 1;
            }
        }
        queued
    }

    async fn run_path_worker(self: Arc<Self>, key: PlanKey, path: String) {
        loop {
            let next = self.registry.update(&key, |plan| plan.next_build(&path));
            let build = match next {
                None => {
                    tracing::debug!(plan = %key, path = %path, "plan gone, build worker exiting");
                    return;
                }
                Some(None) => break,
                Some(Some(build)) => build,
            };

            let outcome = self.exec_build(&key, build).await;
            self.registry.update(&key, |plan| plan.record_outcome(outcome));
        }

        self.finish_if_drained(&key).await;
    }

    /// Fire the plan's completion if nothing is streaming or building. The
    /// first caller to observe the drained state finishes the plan; every
    /// other call is a no-op.
    pub async fn finish_if_drained(&self, key: &PlanKey) {
        let claimed = self
            .registry
            .update(key, |plan| plan.take_completion())
            .unwrap_or(false);
        if !claimed {
            return;
        }
        let Some(plan) = self.registry.remove(key) else {
            return;
        };

        let summary = plan.summary();
        if let Err(err) = self
            .store
            .set_plan_status(key.plan_id, &key.branch, PlanStatus::Finished, None)
            .await
        {
            tracing::error!(plan = %key, error = %err, "failed to mark plan finished");
        }
        tracing::info!(
            plan = %key,
            builds = summary.builds,
            built = summary.built_files.len(),
            failed = summary.failed_paths.len(),
            "plan finished"
        );
        plan.stream(StreamMessage::Finished(summary));
        plan.done.cancel();
    }

    /// End an active plan early. Streams `message` (if any), records
    /// `status` and fires completion. Returns `false` if the plan was not
    /// active.
    pub async fn abort_plan(
        &self,
        key: &PlanKey,
        status: PlanStatus,
        message: Option<StreamMessage>,
        error: Option<&str>,
    ) -> bool {
        let Some(plan) = self.registry.remove(key) else {
            return false;
        };
        plan.cancel.cancel();
        if let Err(err) = self
            .store
            .set_plan_status(key.plan_id, &key.branch, status, error)
            .await
        {
            tracing::error!(plan = %key, error = %err, "failed to record plan status");
        }
        if let Some(message) = message {
            plan.stream(message);
        }
        plan.done.cancel();
        true
    }

    /// Build every stored reply whose operations have not been built yet.
    ///
    /// Registers the plan as active and returns the subscription together
    /// with the number of builds queued. With nothing pending the plan
    /// finishes immediately.
    pub async fn build_pending(
        self: &Arc<Self>,
        plan_id: Uuid,
        branch: &str,
    ) -> Result<(usize, PlanSubscription)> {
        let key = PlanKey::new(plan_id, branch);
        let state = self
            .store
            .load_tell_state(plan_id, branch)
            .await?
            .with_context(|| format!("plan {plan_id} not found"))?;
        let subscription = self.registry.create(key.clone(), &state.contexts, true)?;

        match self.queue_pending(&key).await {
            Ok(queued) => {
                self.registry.update(&key, |plan| plan.reply_streaming = false);
                self.finish_if_drained(&key).await;
                Ok((queued, subscription))
            }
            Err(err) => {
                let message = format!("{err:#}");
                self.abort_plan(
                    &key,
                    PlanStatus::Error,
                    Some(StreamMessage::Error {
                        path: None,
                        message: message.clone(),
                    }),
                    Some(&message),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn queue_pending(self: &Arc<Self>, key: &PlanKey) -> Result<usize> {
        let pending = self.store.pending_replies(key.plan_id, &key.branch).await?;
        if pending.is_empty() {
            tracing::info!(plan = %key, "no pending builds");
            return Ok(0);
        }

        self.store
            .set_plan_status(key.plan_id, &key.branch, PlanStatus::Building, None)
            .await?;

        let mut queued = 0;
        let mut paths = BTreeSet::new();
        for reply in pending {
            let plan_build = self
                .store
                .create_plan_build(key.plan_id, &key.branch, reply.message.id)
                .await?;
            let builds: Vec<ActiveBuild> = reply
                .operations
                .iter()
                .map(|op| ActiveBuild::from_operation(op, reply.message.id, Some(plan_build.id)))
                .collect();
            paths.extend(builds.iter().map(|b| b.path.clone()));
            let count = self.queue_builds(key, builds);
            queued += count;
            if count < reply.operations.len() {
                tracing::warn!(plan = %key, reply = %reply.message.id, "plan stopped while queueing pending builds");
                break;
            }
            self.store.mark_reply_built(reply.message.id).await?;
        }
        tracing::info!(plan = %key, builds = queued, paths = paths.len(), "queued pending builds");
        Ok(queued)
    }
}
