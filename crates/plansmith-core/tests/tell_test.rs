//! End-to-end tests for tell sessions against the in-memory store and a
//! replayed model reply.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use plansmith_db::models::{
    ContextType, ConvoMessage, ConvoRole, Plan, PlanBuild, PlanFileResult, PlanStatus,
};

use plansmith_core::provider::{ChatRole, ProviderError, ReplayProvider};
use plansmith_core::store::{MemoryPlanStore, NewPlanFileResult, PendingReply, PlanStore, TellState};
use plansmith_core::tell::NUM_TELL_STREAM_RETRIES;
use plansmith_core::{
    Builder, EngineConfig, Operation, Orchestrator, PlanKey, StreamMessage, TellError, TellRequest,
    TellStage,
};

const REPLY: &str = "I'll add a second function and a readme.\n\n\
<FileBlock path=\"src/lib.rs\" lang=\"rust\">\n\
```rust\n\
// ... existing code ...\n\
pub fn b() {}\n\
```\n\
</FileBlock>\n\
\n\
<FileBlock path=\"README.md\">\n\
# Demo\n\
</FileBlock>\n\
\n\
<FileOps>\n\
<RemoveFile path=\"old.txt\"/>\n\
</FileOps>\n\
Done.\n";

// ===========================================================================
// Helpers
// ===========================================================================

fn engine_config() -> EngineConfig {
    EngineConfig {
        reset_settle_delay_ms: 0,
        lock_timeout_ms: 200,
        retry_backoff_ms: 0,
        ..EngineConfig::default()
    }
}

struct TestPlan {
    store: Arc<MemoryPlanStore>,
    plan: Plan,
}

impl TestPlan {
    fn new() -> Self {
        let store = Arc::new(MemoryPlanStore::new());
        let plan = store.create_plan("tell", "main");
        store.add_file_context(plan.id, "main", "src/lib.rs", "pub fn a() {}\n");
        Self { store, plan }
    }

    fn orchestrator(&self, provider: &Arc<ReplayProvider>, config: EngineConfig) -> Orchestrator {
        Orchestrator::new(self.store.clone(), provider.clone(), config)
    }

    fn request(&self, prompt: &str) -> TellRequest {
        TellRequest::new(self.plan.id, "main", prompt)
    }

    fn status(&self) -> PlanStatus {
        self.store.branch(self.plan.id, "main").unwrap().status
    }

    async fn current(&self, path: &str) -> Option<String> {
        self.store
            .current_file(self.plan.id, "main", path)
            .await
            .unwrap()
    }
}

fn count<F: Fn(&StreamMessage) -> bool>(messages: &[StreamMessage], f: F) -> usize {
    messages.iter().filter(|m| f(m)).count()
}

fn streamed_reply(messages: &[StreamMessage]) -> String {
    messages
        .iter()
        .filter_map(|m| match m {
            StreamMessage::Reply { chunk } => Some(chunk.as_str()),
            _ => None,
        })
        .collect()
}

// ===========================================================================
// Happy path
// ===========================================================================

#[tokio::test]
async fn tell_streams_reply_and_builds_operations() {
    let t = TestPlan::new();
    let provider = Arc::new(ReplayProvider::from_reply(REPLY, 7));
    let orchestrator = t.orchestrator(&provider, engine_config());

    let handle = orchestrator
        .start_tell(t.request("add b and a readme"))
        .await
        .unwrap();
    let (result, messages) = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("tell did not finish");
    let outcome = result.unwrap();

    assert_eq!(outcome.reply, REPLY);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.operations.len(), 3);
    assert_eq!(outcome.queued_builds, 3);
    assert_eq!(streamed_reply(&messages), REPLY);

    assert_eq!(
        t.current("src/lib.rs").await.as_deref(),
        Some("pub fn a() {}\npub fn b() {}\n")
    );
    assert_eq!(t.current("README.md").await.as_deref(), Some("# Demo\n"));
    assert_eq!(t.current("old.txt").await, None);

    match messages.last() {
        Some(StreamMessage::Finished(summary)) => {
            assert_eq!(summary.built_files, vec!["README.md", "old.txt", "src/lib.rs"]);
            assert!(summary.failed_paths.is_empty());
            assert!(summary.did_edit_files);
        }
        other => panic!("expected Finished last, got {other:?}"),
    }
    assert_eq!(count(&messages, |m| matches!(m, StreamMessage::Finished(_))), 1);

    let convo = t.store.messages(t.plan.id, "main");
    assert_eq!(convo.len(), 2);
    assert_eq!(convo[0].role, ConvoRole::User);
    assert_eq!(convo[1].role, ConvoRole::Assistant);
    assert!(convo[1].did_build);
    assert_eq!(t.store.plan_builds(t.plan.id, "main").len(), 1);
    assert_eq!(t.status(), PlanStatus::Finished);
    assert!(orchestrator.registry().is_empty());
}

#[tokio::test]
async fn single_edit_stores_one_merged_result() {
    let store = Arc::new(MemoryPlanStore::new());
    let plan = store.create_plan("go", "main");
    store.add_file_context(plan.id, "main", "main.go", "package main\n");

    let reply = "Adding an entry point.\n\
<FileBlock path=\"main.go\" lang=\"go\">\n\
```go\n\
// ... existing code ...\n\
\n\
func main() {}\n\
```\n\
</FileBlock>\n";
    let provider = Arc::new(ReplayProvider::from_reply(reply, 5));
    let orchestrator = Orchestrator::new(store.clone(), provider, engine_config());

    let handle = orchestrator
        .start_tell(TellRequest::new(plan.id, "main", "add main"))
        .await
        .unwrap();
    let (result, messages) = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("tell did not finish");
    result.unwrap();

    let results = store.file_results(plan.id, "main");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "main.go");
    assert_eq!(results[0].content, "package main\n\nfunc main() {}\n");
    assert!(!results[0].removed_file);

    let finished: Vec<_> = messages
        .iter()
        .filter(|m| m.is_finished_build())
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].path(), Some("main.go"));
}

#[tokio::test]
async fn progress_is_streamed_while_a_file_block_is_open() {
    let t = TestPlan::new();
    let provider = Arc::new(ReplayProvider::from_reply(REPLY, 3));
    let orchestrator = t.orchestrator(&provider, engine_config());

    let handle = orchestrator.start_tell(t.request("go")).await.unwrap();
    let (result, messages) = handle.wait().await;
    result.unwrap();

    let progress: Vec<usize> = messages
        .iter()
        .filter_map(|m| match m {
            StreamMessage::BuildInfo(info) if info.path == "README.md" && !info.finished => {
                Some(info.num_tokens)
            }
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn edit_progress_never_drops_before_finished() {
    let store = Arc::new(MemoryPlanStore::new());
    let plan = store.create_plan("go", "main");
    store.add_file_context(plan.id, "main", "main.go", "package main\n");

    let reply = "<FileBlock path=\"main.go\" lang=\"go\">\n\
```go\n\
// ... existing code ...\n\
\n\
func main() {\n\
\tprintln(\"hello\")\n\
}\n\
```\n\
</FileBlock>\n";
    let provider = Arc::new(ReplayProvider::from_reply(reply, 8));
    let orchestrator = Orchestrator::new(store.clone(), provider, engine_config());

    let handle = orchestrator
        .start_tell(TellRequest::new(plan.id, "main", "add main"))
        .await
        .unwrap();
    let (result, messages) = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("tell did not finish");
    result.unwrap();

    let counts: Vec<(usize, bool)> = messages
        .iter()
        .filter_map(|m| match m {
            StreamMessage::BuildInfo(info) if info.path == "main.go" => {
                Some((info.num_tokens, info.finished))
            }
            _ => None,
        })
        .collect();
    assert!(counts.len() > 2, "expected streamed progress, got {counts:?}");
    assert_eq!(counts.iter().filter(|(_, finished)| *finished).count(), 1);
    assert!(counts.last().is_some_and(|(_, finished)| *finished));
    let progress: Vec<usize> = counts
        .iter()
        .filter(|(_, finished)| !finished)
        .map(|(n, _)| *n)
        .collect();
    assert!(
        progress.windows(2).all(|w| w[0] <= w[1]),
        "token counts went backwards: {counts:?}"
    );
}

#[tokio::test]
async fn write_after_move_in_one_reply_wins() {
    let store = Arc::new(MemoryPlanStore::new());
    let plan = store.create_plan("go", "main");
    store.add_file_context(plan.id, "main", "a.go", "package a\n");

    let reply = "Renaming, then rewriting.\n\
<FileOps>\n\
<MoveFile from=\"a.go\" to=\"b.go\"/>\n\
</FileOps>\n\
<FileBlock path=\"b.go\">\n\
package b\n\
</FileBlock>\n";
    let provider = Arc::new(ReplayProvider::from_reply(reply, 5));
    let orchestrator = Orchestrator::new(store.clone(), provider, engine_config());

    let handle = orchestrator
        .start_tell(TellRequest::new(plan.id, "main", "rename"))
        .await
        .unwrap();
    let (result, _) = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("tell did not finish");
    let outcome = result.unwrap();
    assert_eq!(outcome.operations.len(), 2);
    assert_eq!(outcome.queued_builds, 2);

    let files = store.current_plan_files(plan.id, "main").await.unwrap();
    assert_eq!(files.get("b.go").map(String::as_str), Some("package b\n"));
    assert!(!files.contains_key("a.go"));
}

#[tokio::test]
async fn prompt_includes_context_and_history() {
    let t = TestPlan::new();
    let provider = Arc::new(ReplayProvider::from_reply("No changes needed.", 64));
    let orchestrator = t.orchestrator(&provider, engine_config());

    for prompt in ["first", "second"] {
        let handle = orchestrator.start_tell(t.request(prompt)).await.unwrap();
        let (result, _) = handle.wait().await;
        assert_eq!(result.unwrap().queued_builds, 0);
    }

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    let second = &requests[1].messages;
    assert_eq!(second[0].role, ChatRole::System);
    assert!(second[1].content.contains("pub fn a() {}"));
    let tail: Vec<(ChatRole, &str)> = second[2..]
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        tail,
        vec![
            (ChatRole::User, "first"),
            (ChatRole::Assistant, "No changes needed."),
            (ChatRole::User, "second"),
        ]
    );
    assert_eq!(t.status(), PlanStatus::Finished);
}

#[tokio::test]
async fn implementation_stage_limits_files_to_current_subtask() {
    let t = TestPlan::new();
    t.store
        .add_file_context(t.plan.id, "main", "src/other.rs", "pub fn other() {}\n");
    t.store
        .add_context(t.plan.id, "main", ContextType::Note, "style", "use tabs");
    t.store
        .add_subtask(t.plan.id, "main", "add b", &["src/lib.rs"]);

    let provider = Arc::new(ReplayProvider::from_reply("ok", 64));
    let orchestrator = t.orchestrator(&provider, engine_config());
    let mut request = t.request("implement");
    request.stage = TellStage::Implementation;
    let (result, _) = orchestrator.start_tell(request).await.unwrap().wait().await;
    result.unwrap();

    let context = &provider.requests()[0].messages[1].content;
    assert!(context.contains("pub fn a() {}"));
    assert!(!context.contains("pub fn other() {}"));
    assert!(context.contains("use tabs"));
}

#[tokio::test]
async fn reply_without_auto_build_is_built_later() {
    let t = TestPlan::new();
    let provider = Arc::new(ReplayProvider::from_reply(REPLY, 16));
    let orchestrator = t.orchestrator(&provider, engine_config());

    let mut request = t.request("plan it");
    request.auto_build = false;
    let (result, _) = orchestrator.start_tell(request).await.unwrap().wait().await;
    assert_eq!(result.unwrap().queued_builds, 0);
    assert_eq!(t.current("README.md").await, None);
    assert_eq!(t.store.pending_replies(t.plan.id, "main").await.unwrap().len(), 1);

    let (queued, sub) = orchestrator.build_pending(t.plan.id, "main").await.unwrap();
    assert_eq!(queued, 3);
    tokio::time::timeout(Duration::from_secs(5), sub.done.cancelled())
        .await
        .expect("builds did not finish");
    assert_eq!(t.current("README.md").await.as_deref(), Some("# Demo\n"));
    assert!(t.store.pending_replies(t.plan.id, "main").await.unwrap().is_empty());
}

/// Delegates to a memory store but stops the plan as soon as a plan build
/// is recorded, before its operations are queued.
struct StopBeforeQueueing {
    inner: Arc<MemoryPlanStore>,
    builder: OnceLock<Arc<Builder>>,
}

#[async_trait]
impl PlanStore for StopBeforeQueueing {
    async fn load_tell_state(&self, plan_id: Uuid, branch: &str) -> anyhow::Result<Option<TellState>> {
        self.inner.load_tell_state(plan_id, branch).await
    }

    async fn current_plan_files(
        &self,
        plan_id: Uuid,
        branch: &str,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        self.inner.current_plan_files(plan_id, branch).await
    }

    async fn set_plan_status(
        &self,
        plan_id: Uuid,
        branch: &str,
        status: PlanStatus,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        self.inner.set_plan_status(plan_id, branch, status, error).await
    }

    async fn add_user_message(
        &self,
        plan_id: Uuid,
        branch: &str,
        message: &str,
        num_tokens: usize,
    ) -> anyhow::Result<ConvoMessage> {
        self.inner.add_user_message(plan_id, branch, message, num_tokens).await
    }

    async fn add_reply(
        &self,
        plan_id: Uuid,
        branch: &str,
        message: &str,
        num_tokens: usize,
        operations: &[Operation],
    ) -> anyhow::Result<ConvoMessage> {
        self.inner
            .add_reply(plan_id, branch, message, num_tokens, operations)
            .await
    }

    async fn pending_replies(&self, plan_id: Uuid, branch: &str) -> anyhow::Result<Vec<PendingReply>> {
        self.inner.pending_replies(plan_id, branch).await
    }

    async fn mark_reply_built(&self, message_id: Uuid) -> anyhow::Result<()> {
        self.inner.mark_reply_built(message_id).await
    }

    async fn create_plan_build(
        &self,
        plan_id: Uuid,
        branch: &str,
        convo_message_id: Uuid,
    ) -> anyhow::Result<PlanBuild> {
        let build = self
            .inner
            .create_plan_build(plan_id, branch, convo_message_id)
            .await?;
        if let Some(builder) = self.builder.get() {
            builder
                .abort_plan(
                    &PlanKey::new(plan_id, branch),
                    PlanStatus::Stopped,
                    Some(StreamMessage::Stopped),
                    None,
                )
                .await;
        }
        Ok(build)
    }

    async fn store_file_result(&self, new: NewPlanFileResult) -> anyhow::Result<PlanFileResult> {
        self.inner.store_file_result(new).await
    }

    async fn reject_file(&self, plan_id: Uuid, branch: &str, path: &str) -> anyhow::Result<u64> {
        self.inner.reject_file(plan_id, branch, path).await
    }

    async fn apply_results(&self, plan_id: Uuid, branch: &str) -> anyhow::Result<u64> {
        self.inner.apply_results(plan_id, branch).await
    }
}

#[tokio::test]
async fn reply_stopped_before_queueing_stays_pending() {
    let t = TestPlan::new();
    let stopping = Arc::new(StopBeforeQueueing {
        inner: t.store.clone(),
        builder: OnceLock::new(),
    });
    let provider = Arc::new(ReplayProvider::from_reply(REPLY, 16));
    let orchestrator = Orchestrator::new(stopping.clone(), provider.clone(), engine_config());
    assert!(stopping.builder.set(Arc::clone(orchestrator.builder())).is_ok());

    let handle = orchestrator.start_tell(t.request("go")).await.unwrap();
    let (result, messages) = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("tell did not finish");
    if let Ok(outcome) = result {
        assert_eq!(outcome.queued_builds, 0);
    }
    assert!(messages.contains(&StreamMessage::Stopped));
    assert!(t.store.file_results(t.plan.id, "main").is_empty());

    // Nothing was queued, so the reply is still waiting to be built.
    let pending = t.store.pending_replies(t.plan.id, "main").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operations.len(), 3);

    let orchestrator = t.orchestrator(&provider, engine_config());
    let (queued, sub) = orchestrator.build_pending(t.plan.id, "main").await.unwrap();
    assert_eq!(queued, 3);
    tokio::time::timeout(Duration::from_secs(5), sub.done.cancelled())
        .await
        .expect("builds did not finish");
    assert_eq!(t.current("README.md").await.as_deref(), Some("# Demo\n"));
    assert!(t.store.pending_replies(t.plan.id, "main").await.unwrap().is_empty());
}

// ===========================================================================
// Retries and failures
// ===========================================================================

#[tokio::test]
async fn transient_failures_are_retried_up_to_the_limit() {
    let t = TestPlan::new();
    let mut provider = ReplayProvider::from_reply(REPLY, 5);
    for _ in 0..NUM_TELL_STREAM_RETRIES {
        provider = provider.with_failure(ProviderError::Transient("connection reset".into()), 2);
    }
    let provider = Arc::new(provider);
    let orchestrator = t.orchestrator(&provider, engine_config());

    let (result, messages) = orchestrator
        .start_tell(t.request("go"))
        .await
        .unwrap()
        .wait()
        .await;
    let outcome = result.unwrap();

    assert_eq!(outcome.attempts, NUM_TELL_STREAM_RETRIES + 1);
    assert_eq!(provider.calls(), (NUM_TELL_STREAM_RETRIES + 1) as usize);
    assert_eq!(outcome.operations.len(), 3);
    assert_eq!(
        count(&messages, |m| matches!(m, StreamMessage::Retrying { .. })),
        NUM_TELL_STREAM_RETRIES as usize
    );
    // Operations from failed attempts are never built.
    assert_eq!(t.store.file_results(t.plan.id, "main").len(), 3);
    assert_eq!(t.status(), PlanStatus::Finished);
}

#[tokio::test]
async fn exhausted_retries_fail_the_plan_without_building() {
    let t = TestPlan::new();
    let mut provider = ReplayProvider::from_reply(REPLY, 5);
    for _ in 0..=NUM_TELL_STREAM_RETRIES {
        provider = provider.with_failure(ProviderError::Transient("overloaded".into()), 0);
    }
    let provider = Arc::new(provider);
    let orchestrator = t.orchestrator(&provider, engine_config());

    let (result, messages) = orchestrator
        .start_tell(t.request("go"))
        .await
        .unwrap()
        .wait()
        .await;

    match result {
        Err(TellError::RetriesExhausted { attempts, .. }) => {
            assert_eq!(attempts, NUM_TELL_STREAM_RETRIES + 1);
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert!(matches!(
        messages.last(),
        Some(StreamMessage::Error { path: None, .. })
    ));
    assert!(t.store.file_results(t.plan.id, "main").is_empty());
    assert!(t.store.plan_builds(t.plan.id, "main").is_empty());
    assert_eq!(t.store.messages(t.plan.id, "main").len(), 1);

    let branch = t.store.branch(t.plan.id, "main").unwrap();
    assert_eq!(branch.status, PlanStatus::Error);
    assert!(branch.error.is_some());
    assert!(orchestrator.registry().is_empty());
}

#[tokio::test]
async fn fatal_provider_error_is_not_retried() {
    let t = TestPlan::new();
    let provider = Arc::new(
        ReplayProvider::from_reply(REPLY, 5)
            .with_failure(ProviderError::Fatal("invalid api key".into()), 0),
    );
    let orchestrator = t.orchestrator(&provider, engine_config());

    let (result, _) = orchestrator
        .start_tell(t.request("go"))
        .await
        .unwrap()
        .wait()
        .await;
    assert!(matches!(result, Err(TellError::Provider(ProviderError::Fatal(_)))));
    assert_eq!(provider.calls(), 1);
    assert_eq!(t.status(), PlanStatus::Error);
}

#[tokio::test]
async fn oversized_prompt_is_rejected_before_sending() {
    let t = TestPlan::new();
    let provider = Arc::new(ReplayProvider::from_reply(REPLY, 5));
    let config = EngineConfig {
        max_context_tokens: 10,
        ..engine_config()
    };
    let orchestrator = t.orchestrator(&provider, config);

    let (result, _) = orchestrator
        .start_tell(t.request(&"word ".repeat(100)))
        .await
        .unwrap()
        .wait()
        .await;
    match result {
        Err(TellError::ContextTooLarge { tokens, max }) => {
            assert_eq!(max, 10);
            assert!(tokens > max);
        }
        other => panic!("expected ContextTooLarge, got {other:?}"),
    }
    assert_eq!(provider.calls(), 0);
    assert!(t.store.messages(t.plan.id, "main").is_empty());
}

#[tokio::test]
async fn unknown_plan_is_rejected() {
    let t = TestPlan::new();
    let provider = Arc::new(ReplayProvider::from_reply(REPLY, 5));
    let orchestrator = t.orchestrator(&provider, engine_config());

    let err = orchestrator
        .start_tell(TellRequest::new(uuid::Uuid::new_v4(), "main", "go"))
        .await
        .unwrap_err();
    assert!(matches!(err, TellError::PlanNotFound(_)));
}

// ===========================================================================
// Concurrency and stop
// ===========================================================================

#[tokio::test]
async fn second_tell_on_active_plan_is_rejected_and_stop_ends_the_first() {
    let t = TestPlan::new();
    let provider = Arc::new(
        ReplayProvider::from_reply(REPLY, 4).with_chunk_delay(Duration::from_millis(20)),
    );
    let orchestrator = t.orchestrator(&provider, engine_config());

    let handle = orchestrator.start_tell(t.request("slow")).await.unwrap();
    let err = orchestrator
        .start_tell(t.request("again"))
        .await
        .unwrap_err();
    assert!(matches!(err, TellError::AlreadyActive(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(orchestrator.stop(t.plan.id, "main").await);
    assert!(!orchestrator.stop(t.plan.id, "main").await);

    let (result, messages) = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("stopped tell did not finish");
    assert!(matches!(result, Err(TellError::Stopped)));
    assert_eq!(messages.last(), Some(&StreamMessage::Stopped));
    assert_eq!(count(&messages, |m| matches!(m, StreamMessage::Stopped)), 1);
    assert!(t.store.file_results(t.plan.id, "main").is_empty());
    assert_eq!(t.status(), PlanStatus::Stopped);

    // The branch can be told again once stopped.
    let provider_calls = provider.calls();
    let handle = orchestrator.start_tell(t.request("retry")).await.unwrap();
    handle.done.cancelled().await;
    assert!(provider.calls() > provider_calls);
}

#[tokio::test]
async fn other_branches_are_independent() {
    let t = TestPlan::new();
    let provider = Arc::new(ReplayProvider::from_reply(REPLY, 8));
    let orchestrator = t.orchestrator(&provider, engine_config());

    let main = orchestrator.start_tell(t.request("main")).await.unwrap();
    let feature = orchestrator
        .start_tell(TellRequest::new(t.plan.id, "feature", "feature"))
        .await
        .unwrap();

    let (main_result, _) = main.wait().await;
    let (feature_result, _) = feature.wait().await;
    main_result.unwrap();
    feature_result.unwrap();

    // The feature branch has no loaded context, so src/lib.rs is a new file there.
    assert_eq!(
        t.store
            .current_file(t.plan.id, "feature", "src/lib.rs")
            .await
            .unwrap()
            .as_deref(),
        Some("// ... existing code ...\npub fn b() {}\n")
    );
    assert_eq!(
        t.current("src/lib.rs").await.as_deref(),
        Some("pub fn a() {}\npub fn b() {}\n")
    );
}
