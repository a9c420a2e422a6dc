//! [`PlanStore`] backed by PostgreSQL via the `plansmith-db` queries.

use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use plansmith_db::models::{ConvoMessage, ConvoRole, PlanBuild, PlanFileResult, PlanStatus};
use plansmith_db::queries::{builds, contexts, convo, file_results, plans, subtasks};
use plansmith_db::queries::convo::NewConvoMessage;

use super::{saturating_i32, NewPlanFileResult, PendingReply, PlanStore, TellState};
use crate::reply::Operation;

#[derive(Debug, Clone)]
pub struct PgPlanStore {
    pool: PgPool,
}

impl PgPlanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PlanStore for PgPlanStore {
    async fn load_tell_state(&self, plan_id: Uuid, branch: &str) -> Result<Option<TellState>> {
        let Some(plan) = plans::get_plan(&self.pool, plan_id).await? else {
            return Ok(None);
        };
        plans::ensure_branch(&self.pool, plan_id, branch).await?;

        Ok(Some(TellState {
            plan,
            contexts: contexts::list_contexts(&self.pool, plan_id, branch).await?,
            convo: convo::list_messages(&self.pool, plan_id, branch).await?,
            subtasks: subtasks::list_subtasks(&self.pool, plan_id, branch).await?,
            current_files: file_results::current_files(&self.pool, plan_id, branch).await?,
        }))
    }

    async fn current_plan_files(
        &self,
        plan_id: Uuid,
        branch: &str,
    ) -> Result<BTreeMap<String, String>> {
        file_results::current_files(&self.pool, plan_id, branch).await
    }

    async fn set_plan_status(
        &self,
        plan_id: Uuid,
        branch: &str,
        status: PlanStatus,
        error: Option<&str>,
    ) -> Result<()> {
        plans::set_branch_status(&self.pool, plan_id, branch, status, error).await
    }

    async fn add_user_message(
        &self,
        plan_id: Uuid,
        branch: &str,
        message: &str,
        num_tokens: usize,
    ) -> Result<ConvoMessage> {
        convo::insert_message(
            &self.pool,
            &NewConvoMessage {
                plan_id,
                branch,
                role: ConvoRole::User,
                message,
                num_tokens: saturating_i32(num_tokens),
                operations: serde_json::Value::Array(Vec::new()),
            },
        )
        .await
    }

    async fn add_reply(
        &self,
        plan_id: Uuid,
        branch: &str,
        message: &str,
        num_tokens: usize,
        operations: &[Operation],
    ) -> Result<ConvoMessage> {
        let operations =
            serde_json::to_value(operations).context("failed to serialize reply operations")?;
        convo::insert_message(
            &self.pool,
            &NewConvoMessage {
                plan_id,
                branch,
                role: ConvoRole::Assistant,
                message,
                num_tokens: saturating_i32(num_tokens),
                operations,
            },
        )
        .await
    }

    async fn pending_replies(&self, plan_id: Uuid, branch: &str) -> Result<Vec<PendingReply>> {
        let messages = convo::list_unbuilt_replies(&self.pool, plan_id, branch).await?;
        messages
            .into_iter()
            .map(|message| {
                let operations: Vec<Operation> = serde_json::from_value(message.operations.clone())
                    .with_context(|| format!("invalid operations on reply {}", message.id))?;
                Ok(PendingReply {
                    message,
                    operations,
                })
            })
            .filter(|pending| {
                pending
                    .as_ref()
                    .map(|p| !p.operations.is_empty())
                    .unwrap_or(true)
            })
            .collect()
    }

    async fn mark_reply_built(&self, message_id: Uuid) -> Result<()> {
        convo::mark_built(&self.pool, message_id).await
    }

    async fn create_plan_build(
        &self,
        plan_id: Uuid,
        branch: &str,
        convo_message_id: Uuid,
    ) -> Result<PlanBuild> {
        builds::insert_plan_build(&self.pool, plan_id, branch, convo_message_id).await
    }

    async fn store_file_result(&self, new: NewPlanFileResult) -> Result<PlanFileResult> {
        file_results::store_file_result(&self.pool, &new).await
    }

    async fn reject_file(&self, plan_id: Uuid, branch: &str, path: &str) -> Result<u64> {
        file_results::reject_path(&self.pool, plan_id, branch, path).await
    }

    async fn apply_results(&self, plan_id: Uuid, branch: &str) -> Result<u64> {
        file_results::apply_pending(&self.pool, plan_id, branch).await
    }
}
