//! Persistence seam for the engine.
//!
//! [`PlanStore`] covers everything a tell session or build worker reads or
//! writes. [`PgPlanStore`] is the production implementation; the in-memory
//! [`MemoryPlanStore`] backs tests and dry runs.

mod memory;
mod postgres;

pub use memory::MemoryPlanStore;
pub use postgres::PgPlanStore;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use plansmith_db::models::{Context, ConvoMessage, Plan, PlanBuild, PlanFileResult, PlanStatus, Subtask};
pub use plansmith_db::queries::file_results::NewPlanFileResult;

use crate::reply::Operation;

/// Everything a tell session needs to assemble a prompt.
#[derive(Debug, Clone)]
pub struct TellState {
    pub plan: Plan,
    pub contexts: Vec<Context>,
    pub convo: Vec<ConvoMessage>,
    pub subtasks: Vec<Subtask>,
    /// Latest non-rejected content per path, with removed paths omitted.
    pub current_files: BTreeMap<String, String>,
}

impl TellState {
    /// The first unfinished subtask, if any.
    pub fn current_subtask(&self) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| !s.is_finished)
    }
}

/// A stored reply whose operations have not been built yet.
#[derive(Debug, Clone)]
pub struct PendingReply {
    pub message: ConvoMessage,
    pub operations: Vec<Operation>,
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Load the plan, its branch contents and current files. Returns `None`
    /// if the plan does not exist.
    async fn load_tell_state(&self, plan_id: Uuid, branch: &str) -> Result<Option<TellState>>;

    async fn current_plan_files(&self, plan_id: Uuid, branch: &str)
        -> Result<BTreeMap<String, String>>;

    /// Latest non-rejected content of one path, `None` if the path has no
    /// result or its latest result removed it.
    async fn current_file(&self, plan_id: Uuid, branch: &str, path: &str) -> Result<Option<String>> {
        let mut files = self.current_plan_files(plan_id, branch).await?;
        Ok(files.remove(path))
    }

    async fn set_plan_status(
        &self,
        plan_id: Uuid,
        branch: &str,
        status: PlanStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn add_user_message(
        &self,
        plan_id: Uuid,
        branch: &str,
        message: &str,
        num_tokens: usize,
    ) -> Result<ConvoMessage>;

    /// Store an assistant reply together with the operations parsed from it.
    async fn add_reply(
        &self,
        plan_id: Uuid,
        branch: &str,
        message: &str,
        num_tokens: usize,
        operations: &[Operation],
    ) -> Result<ConvoMessage>;

    /// Replies with operations that have not been built, oldest first.
    async fn pending_replies(&self, plan_id: Uuid, branch: &str) -> Result<Vec<PendingReply>>;

    async fn mark_reply_built(&self, message_id: Uuid) -> Result<()>;

    async fn create_plan_build(
        &self,
        plan_id: Uuid,
        branch: &str,
        convo_message_id: Uuid,
    ) -> Result<PlanBuild>;

    /// Persist one build result. Either the whole result is stored or
    /// nothing is.
    async fn store_file_result(&self, new: NewPlanFileResult) -> Result<PlanFileResult>;

    /// Reject every pending result for `path`, restoring the last accepted
    /// version as the current one.
    async fn reject_file(&self, plan_id: Uuid, branch: &str, path: &str) -> Result<u64>;

    /// Accept every pending result on the branch.
    async fn apply_results(&self, plan_id: Uuid, branch: &str) -> Result<u64>;
}

// Compile-time assertion: PlanStore must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn PlanStore) {}
};

fn saturating_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
