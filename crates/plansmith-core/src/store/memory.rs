//! In-memory [`PlanStore`] with the same visible semantics as the Postgres
//! store. Used by tests and by `plansmith replay --dry-run`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use plansmith_db::models::{
    Context, ContextType, ConvoMessage, ConvoRole, Plan, PlanBranch, PlanBuild, PlanFileResult,
    PlanStatus, Subtask,
};

use super::{saturating_i32, NewPlanFileResult, PendingReply, PlanStore, TellState};
use crate::reply::Operation;
use crate::tokens;

#[derive(Debug, Default)]
struct State {
    plans: HashMap<Uuid, Plan>,
    branches: HashMap<(Uuid, String), PlanBranch>,
    contexts: Vec<Context>,
    subtasks: Vec<Subtask>,
    convo: Vec<ConvoMessage>,
    builds: Vec<PlanBuild>,
    results: Vec<PlanFileResult>,
    next_result_id: i64,
    failing_paths: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryPlanStore {
    state: Mutex<State>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a plan with one branch in `draft`.
    pub fn create_plan(&self, name: &str, branch: &str) -> Plan {
        let now = Utc::now();
        let plan = Plan {
            id: Uuid::new_v4(),
            name: name.to_string(),
            project_path: String::new(),
            created_at: now,
        };
        let mut state = self.state();
        state.plans.insert(plan.id, plan.clone());
        state.branches.insert(
            (plan.id, branch.to_string()),
            PlanBranch {
                plan_id: plan.id,
                name: branch.to_string(),
                status: PlanStatus::Draft,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );
        plan
    }

    /// Load a file into the plan's context.
    pub fn add_file_context(&self, plan_id: Uuid, branch: &str, path: &str, body: &str) -> Context {
        self.add_context(plan_id, branch, ContextType::File, path, body)
    }

    /// Add a context of any type. For files and maps `name` is the path; for
    /// URLs it is the URL.
    pub fn add_context(
        &self,
        plan_id: Uuid,
        branch: &str,
        context_type: ContextType,
        name: &str,
        body: &str,
    ) -> Context {
        let (file_path, url) = match context_type {
            ContextType::File | ContextType::Map | ContextType::DirectoryTree => (name, ""),
            ContextType::Url => ("", name),
            ContextType::Note | ContextType::Image => ("", ""),
        };
        let ctx = Context {
            id: Uuid::new_v4(),
            plan_id,
            branch: branch.to_string(),
            context_type,
            name: name.to_string(),
            file_path: file_path.to_string(),
            url: url.to_string(),
            body: body.to_string(),
            num_tokens: saturating_i32(tokens::estimate(body)),
            created_at: Utc::now(),
        };
        self.state().contexts.push(ctx.clone());
        ctx
    }

    pub fn add_subtask(&self, plan_id: Uuid, branch: &str, title: &str, uses_files: &[&str]) -> Subtask {
        let mut state = self.state();
        let position = state
            .subtasks
            .iter()
            .filter(|s| s.plan_id == plan_id && s.branch == branch)
            .count();
        let subtask = Subtask {
            id: Uuid::new_v4(),
            plan_id,
            branch: branch.to_string(),
            position: saturating_i32(position),
            title: title.to_string(),
            description: String::new(),
            uses_files: uses_files.iter().map(|s| s.to_string()).collect(),
            is_finished: false,
            created_at: Utc::now(),
        };
        state.subtasks.push(subtask.clone());
        subtask
    }

    pub fn branch(&self, plan_id: Uuid, branch: &str) -> Option<PlanBranch> {
        self.state()
            .branches
            .get(&(plan_id, branch.to_string()))
            .cloned()
    }

    /// Every result stored for the branch, oldest first.
    pub fn file_results(&self, plan_id: Uuid, branch: &str) -> Vec<PlanFileResult> {
        self.state()
            .results
            .iter()
            .filter(|r| r.plan_id == plan_id && r.branch == branch)
            .cloned()
            .collect()
    }

    pub fn messages(&self, plan_id: Uuid, branch: &str) -> Vec<ConvoMessage> {
        self.state()
            .convo
            .iter()
            .filter(|m| m.plan_id == plan_id && m.branch == branch)
            .cloned()
            .collect()
    }

    pub fn plan_builds(&self, plan_id: Uuid, branch: &str) -> Vec<PlanBuild> {
        self.state()
            .builds
            .iter()
            .filter(|b| b.plan_id == plan_id && b.branch == branch)
            .cloned()
            .collect()
    }

    /// Make every later `store_file_result` for `path` fail.
    pub fn fail_writes_for(&self, path: &str) {
        self.state().failing_paths.insert(path.to_string());
    }

    fn current_files_locked(state: &State, plan_id: Uuid, branch: &str) -> BTreeMap<String, String> {
        let mut latest: BTreeMap<&str, &PlanFileResult> = BTreeMap::new();
        for r in state
            .results
            .iter()
            .filter(|r| r.plan_id == plan_id && r.branch == branch && r.rejected_at.is_none())
        {
            // Results are appended in id order, so the last one wins.
            latest.insert(r.path.as_str(), r);
        }
        latest
            .into_iter()
            .filter(|(_, r)| !r.removed_file)
            .map(|(path, r)| (path.to_string(), r.content.clone()))
            .collect()
    }

    fn insert_message(
        &self,
        plan_id: Uuid,
        branch: &str,
        role: ConvoRole,
        message: &str,
        num_tokens: usize,
        operations: serde_json::Value,
    ) -> ConvoMessage {
        let msg = ConvoMessage {
            id: Uuid::new_v4(),
            plan_id,
            branch: branch.to_string(),
            role,
            message: message.to_string(),
            num_tokens: saturating_i32(num_tokens),
            operations,
            did_build: false,
            created_at: Utc::now(),
        };
        self.state().convo.push(msg.clone());
        msg
    }
}

#[async_trait]
impl PlanStore for MemoryPlanStore {
    async fn load_tell_state(&self, plan_id: Uuid, branch: &str) -> Result<Option<TellState>> {
        let mut state = self.state();
        let Some(plan) = state.plans.get(&plan_id).cloned() else {
            return Ok(None);
        };
        let now = Utc::now();
        state
            .branches
            .entry((plan_id, branch.to_string()))
            .or_insert_with(|| PlanBranch {
                plan_id,
                name: branch.to_string(),
                status: PlanStatus::Draft,
                error: None,
                created_at: now,
                updated_at: now,
            });

        let on_branch = |p: Uuid, b: &str| p == plan_id && b == branch;
        let mut subtasks: Vec<Subtask> = state
            .subtasks
            .iter()
            .filter(|s| on_branch(s.plan_id, s.branch.as_str()))
            .cloned()
            .collect();
        subtasks.sort_by_key(|s| s.position);

        Ok(Some(TellState {
            plan,
            contexts: state
                .contexts
                .iter()
                .filter(|c| on_branch(c.plan_id, c.branch.as_str()))
                .cloned()
                .collect(),
            convo: state
                .convo
                .iter()
                .filter(|m| on_branch(m.plan_id, m.branch.as_str()))
                .cloned()
                .collect(),
            subtasks,
            current_files: Self::current_files_locked(&state, plan_id, branch),
        }))
    }

    async fn current_plan_files(
        &self,
        plan_id: Uuid,
        branch: &str,
    ) -> Result<BTreeMap<String, String>> {
        Ok(Self::current_files_locked(&self.state(), plan_id, branch))
    }

    async fn set_plan_status(
        &self,
        plan_id: Uuid,
        branch: &str,
        status: PlanStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state();
        let row = state
            .branches
            .get_mut(&(plan_id, branch.to_string()))
            .ok_or_else(|| anyhow!("branch {branch:?} of plan {plan_id} not found"))?;
        row.status = status;
        row.error = error.map(str::to_string);
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn add_user_message(
        &self,
        plan_id: Uuid,
        branch: &str,
        message: &str,
        num_tokens: usize,
    ) -> Result<ConvoMessage> {
        Ok(self.insert_message(
            plan_id,
            branch,
            ConvoRole::User,
            message,
            num_tokens,
            serde_json::Value::Array(Vec::new()),
        ))
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
        Ok(self.insert_message(
            plan_id,
            branch,
            ConvoRole::Assistant,
            message,
            num_tokens,
            operations,
        ))
    }

    async fn pending_replies(&self, plan_id: Uuid, branch: &str) -> Result<Vec<PendingReply>> {
        let unbuilt: Vec<ConvoMessage> = self
            .state()
            .convo
            .iter()
            .filter(|m| {
                m.plan_id == plan_id
                    && m.branch == branch
                    && m.role == ConvoRole::Assistant
                    && !m.did_build
            })
            .cloned()
            .collect();

        let mut pending = Vec::new();
        for message in unbuilt {
            let operations: Vec<Operation> = serde_json::from_value(message.operations.clone())
                .with_context(|| format!("invalid operations on reply {}", message.id))?;
            if !operations.is_empty() {
                pending.push(PendingReply {
                    message,
                    operations,
                });
            }
        }
        Ok(pending)
    }

    async fn mark_reply_built(&self, message_id: Uuid) -> Result<()> {
        let mut state = self.state();
        let msg = state
            .convo
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| anyhow!("message {message_id} not found"))?;
        msg.did_build = true;
        Ok(())
    }

    async fn create_plan_build(
        &self,
        plan_id: Uuid,
        branch: &str,
        convo_message_id: Uuid,
    ) -> Result<PlanBuild> {
        let build = PlanBuild {
            id: Uuid::new_v4(),
            plan_id,
            branch: branch.to_string(),
            convo_message_id,
            created_at: Utc::now(),
        };
        self.state().builds.push(build.clone());
        Ok(build)
    }

    async fn store_file_result(&self, new: NewPlanFileResult) -> Result<PlanFileResult> {
        let mut state = self.state();
        if state.failing_paths.contains(&new.path) {
            bail!("failed to insert file result for {}", new.path);
        }
        state.next_result_id += 1;
        let result = PlanFileResult {
            id: state.next_result_id,
            plan_id: new.plan_id,
            branch: new.branch,
            plan_build_id: new.plan_build_id,
            convo_message_id: new.convo_message_id,
            path: new.path,
            content: new.content,
            removed_file: new.removed_file,
            created_at: Utc::now(),
            applied_at: None,
            rejected_at: None,
        };
        state.results.push(result.clone());
        Ok(result)
    }

    async fn reject_file(&self, plan_id: Uuid, branch: &str, path: &str) -> Result<u64> {
        let now = Utc::now();
        let mut rejected = 0;
        for r in self.state().results.iter_mut().filter(|r| {
            r.plan_id == plan_id && r.branch == branch && r.path == path && r.is_pending()
        }) {
            r.rejected_at = Some(now);
            rejected += 1;
        }
        Ok(rejected)
    }

    async fn apply_results(&self, plan_id: Uuid, branch: &str) -> Result<u64> {
        let now = Utc::now();
        let mut applied = 0;
        for r in self
            .state()
            .results
            .iter_mut()
            .filter(|r| r.plan_id == plan_id && r.branch == branch && r.is_pending())
        {
            r.applied_at = Some(now);
            applied += 1;
        }
        Ok(applied)
    }
}
