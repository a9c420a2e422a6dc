//! The per-file build state machine.
//!
//! ```text
//! resolve pre-build state
//!     |
//!     +-- move    --> hand source content to the destination's move-in,
//!     |               remove(source) at head of source queue
//!     +-- move-in --> wait for the source content, store it, stream finished
//!     +-- remove  --> store removal, stream finished+removed
//!     +-- reset   --> write-lock, reject pending results, stream finished, settle
//!     +-- new     --> store content, stream finished
//!     +-- edit    --> stream progress, structured edits, store, stream finished
//! ```
//!
//! A move's destination half is queued together with the move itself, so it
//! keeps its reply position among other builds for the destination.
//!
//! Any failure goes to [`Builder::on_build_file_error`], which reports it on
//! the stream and lets the worker move on to the next queued build.

use std::sync::Arc;
use std::time::Instant;

use crate::active::{ActiveBuild, ActivePlan, BuildKind, PlanKey};
use crate::store::NewPlanFileResult;
use crate::stream::{BuildInfo, StreamMessage};
use crate::tokens;

use super::{BuildError, Builder};

impl Builder {
    pub(super) async fn exec_build(self: &Arc<Self>, key: &PlanKey, mut build: ActiveBuild) -> ActiveBuild {
        let started = Instant::now();
        match self.build_file(key, &mut build).await {
            Ok(()) => {
                build.success = true;
                tracing::info!(
                    plan = %key,
                    path = %build.path,
                    kind = ?build.kind,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "build finished"
                );
            }
            Err(err) => self.on_build_file_error(key, &mut build, err),
        }
        build
    }

    async fn build_file(self: &Arc<Self>, key: &PlanKey, build: &mut ActiveBuild) -> Result<(), BuildError> {
        let plan = self
            .registry
            .get(key)
            .ok_or_else(|| BuildError::PlanNotActive(key.clone()))?;

        match build.kind.clone() {
            BuildKind::Move { destination } => {
                let resolved = match self.resolve_pre_build_state(key, &plan, &build.path).await {
                    Ok(Some(content)) => Ok(content),
                    Ok(None) => Err(BuildError::FileNotFound(build.path.clone())),
                    Err(err) => Err(err),
                };
                self.hand_off_move(key, build, &resolved);
                resolved?;
                self.build_move(key, build, &destination)
            }
            BuildKind::MoveIn { source } => self.build_move_in(key, &plan, build, &source).await,
            BuildKind::Remove => self.build_remove(key, build).await,
            BuildKind::Reset => self.build_reset(key, &plan, build).await,
            BuildKind::Edit => {
                let current = self
                    .resolve_pre_build_state(key, &plan, &build.path)
                    .await?
                    .unwrap_or_default();
                if current.is_empty() {
                    self.build_new_file(key, build).await
                } else {
                    self.build_edit(key, build, current).await
                }
            }
        }
    }

    /// The file as the plan currently sees it: the latest plan result if
    /// there is one, else the loaded context, else nothing.
    async fn resolve_pre_build_state(
        &self,
        key: &PlanKey,
        plan: &ActivePlan,
        path: &str,
    ) -> Result<Option<String>, BuildError> {
        let current = self
            .store
            .current_file(key.plan_id, &key.branch, path)
            .await
            .map_err(BuildError::Store)?;
        Ok(current.or_else(|| plan.contexts_by_path.get(path).map(|c| c.body.clone())))
    }

    /// Publish the source content (or why it is missing) to the waiting
    /// destination worker.
    fn hand_off_move(&self, key: &PlanKey, build: &ActiveBuild, resolved: &Result<String, BuildError>) {
        let Some(id) = build.move_id else {
            return;
        };
        let value = match resolved {
            Ok(content) => Ok(content.clone()),
            Err(err) => Err(err.to_string()),
        };
        self.registry.update(key, |plan| {
            if let Some(handoff) = plan.move_handoffs.get(&id) {
                handoff.send_replace(Some(value));
            }
        });
    }

    fn build_move(&self, key: &PlanKey, build: &ActiveBuild, destination: &str) -> Result<(), BuildError> {
        let mut remove = ActiveBuild::new(build.reply_id, build.path.clone(), BuildKind::Remove);
        remove.plan_build_id = build.plan_build_id;

        // This worker owns the source path, so the remove runs next.
        self.registry
            .update(key, |plan| plan.enqueue_front(remove))
            .ok_or_else(|| BuildError::PlanNotActive(key.clone()))?;

        tracing::debug!(plan = %key, from = %build.path, to = %destination, "move handed off");
        Ok(())
    }

    async fn build_move_in(
        &self,
        key: &PlanKey,
        plan: &ActivePlan,
        build: &mut ActiveBuild,
        source: &str,
    ) -> Result<(), BuildError> {
        let id = build
            .move_id
            .ok_or_else(|| BuildError::FileNotFound(source.to_string()))?;
        let mut rx = plan
            .move_handoffs
            .get(&id)
            .map(|handoff| handoff.subscribe())
            .ok_or_else(|| BuildError::PlanNotActive(key.clone()))?;

        let received = tokio::select! {
            _ = plan.cancel.cancelled() => None,
            value = rx.wait_for(Option::is_some) => value.ok().and_then(|v| (*v).clone()),
        };
        self.registry.update(key, |plan| plan.move_handoffs.remove(&id));

        match received {
            Some(Ok(content)) => {
                build.file_content_tokens = tokens::estimate(&content);
                build.file_content = content;
                self.build_new_file(key, build).await
            }
            Some(Err(reason)) => Err(BuildError::MoveSource {
                path: source.to_string(),
                reason,
            }),
            None => Err(BuildError::PlanNotActive(key.clone())),
        }
    }

    async fn build_remove(&self, key: &PlanKey, build: &ActiveBuild) -> Result<(), BuildError> {
        self.store_result(key, build, String::new(), true).await?;
        self.stream(key, StreamMessage::BuildInfo(BuildInfo::finished(&build.path, 0, true)));
        Ok(())
    }

    async fn build_reset(&self, key: &PlanKey, plan: &ActivePlan, build: &ActiveBuild) -> Result<(), BuildError> {
        let lock = Arc::clone(&plan.build_lock);
        let guard = tokio::time::timeout(self.timing.lock_timeout, lock.write_owned())
            .await
            .map_err(|_| BuildError::LockTimeout)?;
        let rejected = self
            .store
            .reject_file(key.plan_id, &key.branch, &build.path)
            .await;
        drop(guard);
        let rejected = rejected.map_err(BuildError::Store)?;

        let still_exists = plan.contexts_by_path.contains_key(&build.path)
            || self
                .store
                .current_file(key.plan_id, &key.branch, &build.path)
                .await
                .map_err(BuildError::Store)?
                .is_some();
        tracing::debug!(plan = %key, path = %build.path, rejected, still_exists, "reset pending changes");

        self.stream(
            key,
            StreamMessage::BuildInfo(BuildInfo::finished(&build.path, 0, !still_exists)),
        );
        tokio::time::sleep(self.timing.reset_settle_delay).await;
        Ok(())
    }

    async fn build_new_file(&self, key: &PlanKey, build: &ActiveBuild) -> Result<(), BuildError> {
        self.store_result(key, build, build.file_content.clone(), false).await?;
        self.stream(
            key,
            StreamMessage::BuildInfo(BuildInfo::finished(&build.path, content_tokens(build), false)),
        );
        Ok(())
    }

    async fn build_edit(&self, key: &PlanKey, build: &mut ActiveBuild, current: String) -> Result<(), BuildError> {
        build.current_file_tokens = tokens::estimate(&current);
        let streamed = self
            .registry
            .update(key, |plan| {
                plan.did_edit_files = true;
                plan.streamed_tokens(&build.path)
            })
            .unwrap_or(0);
        // Counts for a path never drop below what the reply already streamed.
        self.stream(
            key,
            StreamMessage::BuildInfo(BuildInfo::progress(
                &build.path,
                content_tokens(build).max(streamed),
            )),
        );

        let merged = self
            .edits
            .apply(&build.path, &current, &build.file_content)
            .await
            .map_err(BuildError::Edit)?;
        self.store_result(key, build, merged, false).await?;

        self.stream(
            key,
            StreamMessage::BuildInfo(BuildInfo::finished(&build.path, content_tokens(build), false)),
        );
        Ok(())
    }

    async fn store_result(
        &self,
        key: &PlanKey,
        build: &ActiveBuild,
        content: String,
        removed_file: bool,
    ) -> Result<(), BuildError> {
        self.store
            .store_file_result(NewPlanFileResult {
                plan_id: key.plan_id,
                branch: key.branch.clone(),
                plan_build_id: build.plan_build_id,
                convo_message_id: Some(build.reply_id),
                path: build.path.clone(),
                content,
                removed_file,
            })
            .await
            .map_err(BuildError::Store)?;
        Ok(())
    }

    fn on_build_file_error(&self, key: &PlanKey, build: &mut ActiveBuild, err: BuildError) {
        let message = err.to_string();
        tracing::error!(plan = %key, path = %build.path, error = %message, "file build failed");
        build.success = false;
        build.error = Some(message.clone());
        self.stream(
            key,
            StreamMessage::Error {
                path: Some(build.path.clone()),
                message,
            },
        );
    }

    /// Stream to the plan's client if the plan is still active.
    pub(crate) fn stream(&self, key: &PlanKey, message: StreamMessage) {
        self.registry.update(key, |plan| {
            plan.note_progress(&message);
            plan.stream(message);
        });
    }
}

fn content_tokens(build: &ActiveBuild) -> usize {
    if build.file_content_tokens > 0 {
        build.file_content_tokens
    } else {
        tokens::estimate(&build.file_content)
    }
}
