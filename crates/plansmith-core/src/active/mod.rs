//! In-memory state for plans that are currently replying or building.

mod registry;

pub use registry::{ActivePlanRegistry, PlanSubscription, RegistryError};

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use plansmith_db::models::{Context, ContextType};

use crate::reply::{Operation, OperationKind};
use crate::stream::{BuildSummary, StreamMessage};
use crate::tokens;

/// Identifies one branch of one plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanKey {
    pub plan_id: Uuid,
    pub branch: String,
}

impl PlanKey {
    pub fn new(plan_id: Uuid, branch: impl Into<String>) -> Self {
        Self {
            plan_id,
            branch: branch.into(),
        }
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.plan_id, self.branch)
    }
}

/// The kind of a queued build. Exactly one applies to each build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BuildKind {
    /// Create or edit the file with the build's content.
    #[default]
    Edit,
    Move { destination: String },
    /// Destination half of a move. Waits for the source worker to hand over
    /// the file content, then stores it as a new file.
    MoveIn { source: String },
    Remove,
    Reset,
}

/// One file operation waiting for, or produced by, a path's build worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveBuild {
    /// Conversation message the operation came from.
    pub reply_id: Uuid,
    pub plan_build_id: Option<Uuid>,
    pub path: String,
    pub kind: BuildKind,
    /// Pairs a `Move` with its `MoveIn`.
    pub move_id: Option<Uuid>,
    pub file_content: String,
    pub file_content_tokens: usize,
    /// Token count of the file before this build ran. Set for edits.
    pub current_file_tokens: usize,
    pub success: bool,
    pub error: Option<String>,
}

impl ActiveBuild {
    pub fn new(reply_id: Uuid, path: impl Into<String>, kind: BuildKind) -> Self {
        Self {
            reply_id,
            plan_build_id: None,
            path: path.into(),
            kind,
            move_id: None,
            file_content: String::new(),
            file_content_tokens: 0,
            current_file_tokens: 0,
            success: false,
            error: None,
        }
    }

    /// A create/edit build carrying `content`.
    pub fn edit(reply_id: Uuid, path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let mut build = Self::new(reply_id, path, BuildKind::Edit);
        build.file_content_tokens = tokens::estimate(&content);
        build.file_content = content;
        build
    }

    pub fn from_operation(op: &Operation, reply_id: Uuid, plan_build_id: Option<Uuid>) -> Self {
        let kind = match &op.kind {
            OperationKind::File => BuildKind::Edit,
            OperationKind::Move { destination } => BuildKind::Move {
                destination: destination.clone(),
            },
            OperationKind::Remove => BuildKind::Remove,
            OperationKind::Reset => BuildKind::Reset,
        };
        let mut build = Self::new(reply_id, op.path.clone(), kind);
        build.plan_build_id = plan_build_id;
        build.file_content = op.content.clone();
        build.file_content_tokens = if op.num_tokens > 0 {
            op.num_tokens
        } else {
            tokens::estimate(&op.content)
        };
        build
    }

    pub fn is_file_operation(&self) -> bool {
        !matches!(self.kind, BuildKind::Edit)
    }
}

/// The source content of a move once its source worker has resolved it, or
/// the reason it could not.
pub(crate) type MoveHandoff = Arc<watch::Sender<Option<Result<String, String>>>>;

/// Everything the engine tracks for one plan branch while it is active.
///
/// Cloning produces a snapshot; mutations go through
/// [`ActivePlanRegistry::update`].
#[derive(Debug, Clone)]
pub struct ActivePlan {
    pub key: PlanKey,
    pub build_queues_by_path: HashMap<String, VecDeque<ActiveBuild>>,
    pub is_building_by_path: HashMap<String, bool>,
    /// File contexts loaded for the plan, keyed by path.
    pub contexts_by_path: HashMap<String, Arc<Context>>,
    pub built_files: HashSet<String>,
    pub did_edit_files: bool,
    /// Set while a reply is still being streamed and may queue more builds.
    pub reply_streaming: bool,
    pub completed_builds: Vec<ActiveBuild>,
    pub build_lock: Arc<RwLock<()>>,
    pub(crate) move_handoffs: HashMap<Uuid, MoveHandoff>,
    /// Highest in-progress token count streamed per path since its last
    /// finished build.
    streamed_tokens_by_path: HashMap<String, usize>,
    pub cancel: CancellationToken,
    pub done: CancellationToken,
    done_fired: bool,
    messages: mpsc::UnboundedSender<StreamMessage>,
}

impl ActivePlan {
    fn new(
        key: PlanKey,
        contexts: &[Context],
        reply_streaming: bool,
        messages: mpsc::UnboundedSender<StreamMessage>,
    ) -> Self {
        let contexts_by_path = contexts
            .iter()
            .filter(|c| c.context_type == ContextType::File && !c.file_path.is_empty())
            .map(|c| (c.file_path.clone(), Arc::new(c.clone())))
            .collect();

        Self {
            key,
            build_queues_by_path: HashMap::new(),
            is_building_by_path: HashMap::new(),
            contexts_by_path,
            built_files: HashSet::new(),
            did_edit_files: false,
            reply_streaming,
            completed_builds: Vec::new(),
            build_lock: Arc::new(RwLock::new(())),
            move_handoffs: HashMap::new(),
            streamed_tokens_by_path: HashMap::new(),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            done_fired: false,
            messages,
        }
    }

    /// Send a message to the client. A closed channel is not an error; the
    /// plan keeps building without a listener.
    pub fn stream(&self, message: StreamMessage) {
        let _ = self.messages.send(message);
    }

    pub(crate) fn note_progress(&mut self, message: &StreamMessage) {
        let StreamMessage::BuildInfo(info) = message else {
            return;
        };
        if info.finished {
            self.streamed_tokens_by_path.remove(&info.path);
        } else {
            let seen = self.streamed_tokens_by_path.entry(info.path.clone()).or_default();
            *seen = (*seen).max(info.num_tokens);
        }
    }

    pub(crate) fn streamed_tokens(&self, path: &str) -> usize {
        self.streamed_tokens_by_path.get(path).copied().unwrap_or(0)
    }

    pub fn is_building(&self, path: &str) -> bool {
        self.is_building_by_path.get(path).copied().unwrap_or(false)
    }

    /// Append `build` to its path's queue. Returns `true` when the caller
    /// must start a worker for the path.
    pub(crate) fn enqueue(&mut self, build: ActiveBuild) -> bool {
        let path = build.path.clone();
        self.build_queues_by_path
            .entry(path.clone())
            .or_default()
            .push_back(build);
        let building = self.is_building_by_path.entry(path).or_insert(false);
        if *building {
            false
        } else {
            *building = true;
            true
        }
    }

    /// Queue one reply operation. A move also takes its place in the
    /// destination queue right away, so later writes to the destination run
    /// after it. Returns the paths that need a worker started.
    pub(crate) fn enqueue_operation(&mut self, mut build: ActiveBuild) -> Vec<String> {
        let destination = match &build.kind {
            BuildKind::Move { destination } => Some(destination.clone()),
            _ => None,
        };
        let Some(destination) = destination else {
            let path = build.path.clone();
            return if self.enqueue(build) { vec![path] } else { Vec::new() };
        };

        let id = Uuid::new_v4();
        let (tx, _) = watch::channel(None);
        self.move_handoffs.insert(id, Arc::new(tx));

        let mut move_in = ActiveBuild::new(
            build.reply_id,
            destination,
            BuildKind::MoveIn {
                source: build.path.clone(),
            },
        );
        move_in.plan_build_id = build.plan_build_id;
        move_in.move_id = Some(id);
        build.move_id = Some(id);

        let mut started = Vec::new();
        for build in [build, move_in] {
            let path = build.path.clone();
            if self.enqueue(build) {
                started.push(path);
            }
        }
        started
    }

    /// Put `build` at the head of its path's queue. Only valid while that
    /// path's worker is running.
    pub(crate) fn enqueue_front(&mut self, build: ActiveBuild) {
        self.build_queues_by_path
            .entry(build.path.clone())
            .or_default()
            .push_front(build);
    }

    /// Pop the next build for `path`. When the queue is empty the path is
    /// marked idle in the same step.
    pub(crate) fn next_build(&mut self, path: &str) -> Option<ActiveBuild> {
        let next = self
            .build_queues_by_path
            .get_mut(path)
            .and_then(VecDeque::pop_front);
        if next.is_none() {
            self.is_building_by_path.insert(path.to_string(), false);
        }
        next
    }

    pub(crate) fn record_outcome(&mut self, build: ActiveBuild) {
        if build.success {
            self.built_files.insert(build.path.clone());
        }
        self.completed_builds.push(build);
    }

    /// No reply is streaming, no path is building and every queue is empty.
    pub fn is_drained(&self) -> bool {
        !self.reply_streaming
            && !self.is_building_by_path.values().any(|b| *b)
            && self.build_queues_by_path.values().all(VecDeque::is_empty)
    }

    /// Claim the completion signal. Returns `true` for exactly one caller,
    /// the first to observe the plan drained.
    pub(crate) fn take_completion(&mut self) -> bool {
        if !self.done_fired && self.is_drained() {
            self.done_fired = true;
            true
        } else {
            false
        }
    }

    pub fn summary(&self) -> BuildSummary {
        let built: BTreeSet<&String> = self.built_files.iter().collect();
        // A path counts as failed if its last build failed.
        let mut last_by_path: HashMap<&str, bool> = HashMap::new();
        for build in &self.completed_builds {
            last_by_path.insert(build.path.as_str(), build.success);
        }
        let failed: BTreeSet<&str> = last_by_path
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(path, _)| path)
            .collect();

        BuildSummary {
            built_files: built.into_iter().cloned().collect(),
            failed_paths: failed.into_iter().map(str::to_string).collect(),
            builds: self.completed_builds.len(),
            did_edit_files: self.did_edit_files,
        }
    }
}
