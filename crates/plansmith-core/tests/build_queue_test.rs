//! Tests for per-path build queues and the file build state machine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use plansmith_db::models::Plan;

use plansmith_core::build::{ReferenceMerge, StructuredEdits};
use plansmith_core::store::{MemoryPlanStore, NewPlanFileResult, PlanStore};
use plansmith_core::{
    ActiveBuild, ActivePlanRegistry, BuildInfo, BuildKind, Builder, EngineConfig, PlanKey,
    PlanSubscription, StreamMessage,
};

// ===========================================================================
// Fixture
// ===========================================================================

struct Fixture {
    store: Arc<MemoryPlanStore>,
    registry: Arc<ActivePlanRegistry>,
    builder: Arc<Builder>,
    plan: Plan,
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        reset_settle_delay_ms: 0,
        lock_timeout_ms: 200,
        retry_backoff_ms: 0,
        ..EngineConfig::default()
    }
}

impl Fixture {
    fn new() -> Self {
        Self::with_edits(Arc::new(ReferenceMerge))
    }

    fn with_edits(edits: Arc<dyn StructuredEdits>) -> Self {
        let store = Arc::new(MemoryPlanStore::new());
        let plan = store.create_plan("build-queue", "main");
        let registry = Arc::new(ActivePlanRegistry::new());
        let builder = Builder::new(Arc::clone(&registry), store.clone(), edits, &engine_config());
        Self {
            store,
            registry,
            builder,
            plan,
        }
    }

    fn key(&self) -> PlanKey {
        PlanKey::new(self.plan.id, "main")
    }

    async fn activate(&self) -> PlanSubscription {
        let state = self
            .store
            .load_tell_state(self.plan.id, "main")
            .await
            .unwrap()
            .unwrap();
        self.registry
            .create(self.key(), &state.contexts, true)
            .unwrap()
    }

    /// Queue `builds`, mark the reply done and wait for the plan to drain.
    async fn run(&self, builds: Vec<ActiveBuild>) -> Vec<StreamMessage> {
        let mut sub = self.activate().await;
        self.builder.queue_builds(&self.key(), builds);
        self.finish(&mut sub).await
    }

    async fn finish(&self, sub: &mut PlanSubscription) -> Vec<StreamMessage> {
        let key = self.key();
        self.registry
            .update(&key, |plan| plan.reply_streaming = false);
        self.builder.finish_if_drained(&key).await;
        tokio::time::timeout(Duration::from_secs(5), sub.done.cancelled())
            .await
            .expect("plan did not finish");
        drain(&mut sub.messages)
    }

    async fn current(&self, path: &str) -> Option<String> {
        self.store
            .current_file(self.plan.id, "main", path)
            .await
            .unwrap()
    }

    fn result(&self, path: &str, content: &str) -> NewPlanFileResult {
        NewPlanFileResult {
            plan_id: self.plan.id,
            branch: "main".into(),
            plan_build_id: None,
            convo_message_id: None,
            path: path.into(),
            content: content.into(),
            removed_file: false,
        }
    }
}

fn drain(rx: &mut UnboundedReceiver<StreamMessage>) -> Vec<StreamMessage> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

fn finished_for<'a>(messages: &'a [StreamMessage], path: &str) -> Vec<&'a BuildInfo> {
    messages
        .iter()
        .filter_map(|m| match m {
            StreamMessage::BuildInfo(info) if info.path == path && info.finished => Some(info),
            _ => None,
        })
        .collect()
}

fn errors_for(messages: &[StreamMessage], path: &str) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, StreamMessage::Error { path: Some(p), .. } if p == path))
        .count()
}

fn contents_of(f: &Fixture, path: &str) -> Vec<String> {
    f.store
        .file_results(f.plan.id, "main")
        .into_iter()
        .filter(|r| r.path == path)
        .map(|r| r.content)
        .collect()
}

fn summary(messages: &[StreamMessage]) -> &plansmith_core::BuildSummary {
    match messages.last() {
        Some(StreamMessage::Finished(summary)) => summary,
        other => panic!("expected Finished last, got {other:?}"),
    }
}

// ===========================================================================
// Queueing
// ===========================================================================

#[tokio::test]
async fn same_path_builds_run_in_queue_order() {
    let f = Fixture::new();
    let reply = Uuid::new_v4();
    let messages = f
        .run(vec![
            ActiveBuild::edit(reply, "a.txt", "v1\n"),
            ActiveBuild::edit(reply, "b.txt", "b\n"),
            ActiveBuild::edit(reply, "a.txt", "v2\n"),
            ActiveBuild::edit(reply, "a.txt", "v3\n"),
        ])
        .await;

    let contents: Vec<String> = f
        .store
        .file_results(f.plan.id, "main")
        .into_iter()
        .filter(|r| r.path == "a.txt")
        .map(|r| r.content)
        .collect();
    assert_eq!(contents, vec!["v1\n", "v2\n", "v3\n"]);
    assert_eq!(f.current("a.txt").await.as_deref(), Some("v3\n"));
    assert_eq!(f.current("b.txt").await.as_deref(), Some("b\n"));

    assert_eq!(finished_for(&messages, "a.txt").len(), 3);
    let summary = summary(&messages);
    assert_eq!(summary.builds, 4);
    assert_eq!(summary.built_files, vec!["a.txt", "b.txt"]);
    assert!(summary.failed_paths.is_empty());
    assert!(summary.did_edit_files);
    assert!(f.registry.is_empty());
}

#[tokio::test]
async fn queueing_on_a_busy_path_appends_to_its_queue() {
    let f = Fixture::new();
    let _sub = f.activate().await;
    let key = f.key();
    let reply = Uuid::new_v4();

    // No await in between, so the spawned worker has not run yet.
    assert!(f.builder.queue_build(&key, ActiveBuild::edit(reply, "a.txt", "1")));
    assert!(f.builder.queue_build(&key, ActiveBuild::edit(reply, "a.txt", "2")));

    let snapshot = f.registry.get(&key).unwrap();
    assert!(snapshot.is_building("a.txt"));
    let queued: Vec<&str> = snapshot.build_queues_by_path["a.txt"]
        .iter()
        .map(|b| b.file_content.as_str())
        .collect();
    assert_eq!(queued, vec!["1", "2"]);
}

#[tokio::test]
async fn queue_build_on_inactive_plan_is_dropped() {
    let f = Fixture::new();
    let queued = f
        .builder
        .queue_build(&f.key(), ActiveBuild::edit(Uuid::new_v4(), "a.txt", "x"));
    assert!(!queued);
    assert!(f.store.file_results(f.plan.id, "main").is_empty());
}

// ===========================================================================
// Build kinds
// ===========================================================================

#[tokio::test]
async fn edit_merges_into_loaded_context() {
    let f = Fixture::new();
    f.store
        .add_file_context(f.plan.id, "main", "src/lib.rs", "one\ntwo\n");

    let messages = f
        .run(vec![ActiveBuild::edit(
            Uuid::new_v4(),
            "src/lib.rs",
            "zero\n// ... existing code ...\n",
        )])
        .await;

    assert_eq!(f.current("src/lib.rs").await.as_deref(), Some("zero\none\ntwo\n"));

    let progress: Vec<&StreamMessage> = messages
        .iter()
        .filter(|m| matches!(m, StreamMessage::BuildInfo(info) if !info.finished))
        .collect();
    assert_eq!(progress.len(), 1);
    // Starts at the content's token count, not zero.
    assert!(matches!(progress[0], StreamMessage::BuildInfo(info) if info.num_tokens > 0));
    assert_eq!(finished_for(&messages, "src/lib.rs").len(), 1);
}

#[tokio::test]
async fn new_file_is_stored_without_edit_progress() {
    let f = Fixture::new();
    let messages = f
        .run(vec![ActiveBuild::edit(Uuid::new_v4(), "new.txt", "hello\n")])
        .await;

    assert_eq!(f.current("new.txt").await.as_deref(), Some("hello\n"));
    assert_eq!(messages.len(), 2);
    let finished = finished_for(&messages, "new.txt");
    assert_eq!(finished.len(), 1);
    assert!(!finished[0].removed);
    assert!(!summary(&messages).did_edit_files);
}

#[tokio::test]
async fn move_becomes_remove_and_create() {
    let f = Fixture::new();
    f.store
        .add_file_context(f.plan.id, "main", "old.txt", "hello\n");

    let reply = Uuid::new_v4();
    let mut build = ActiveBuild::new(
        reply,
        "old.txt",
        BuildKind::Move {
            destination: "new.txt".into(),
        },
    );
    build.plan_build_id = Some(Uuid::new_v4());
    let messages = f.run(vec![build]).await;

    assert_eq!(f.current("new.txt").await.as_deref(), Some("hello\n"));
    assert_eq!(f.current("old.txt").await, None);

    let removed = finished_for(&messages, "old.txt");
    assert_eq!(removed.len(), 1);
    assert!(removed[0].removed);
    assert_eq!(finished_for(&messages, "new.txt").len(), 1);

    let results = f.store.file_results(f.plan.id, "main");
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.convo_message_id == Some(reply)));

    let summary = summary(&messages);
    assert_eq!(summary.built_files, vec!["new.txt", "old.txt"]);
    assert_eq!(summary.builds, 3);
}

#[tokio::test]
async fn move_of_unknown_file_fails_both_paths() {
    let f = Fixture::new();
    let build = ActiveBuild::new(
        Uuid::new_v4(),
        "ghost.txt",
        BuildKind::Move {
            destination: "new.txt".into(),
        },
    );
    let messages = f.run(vec![build]).await;

    assert_eq!(errors_for(&messages, "ghost.txt"), 1);
    assert_eq!(errors_for(&messages, "new.txt"), 1);
    assert!(f.store.file_results(f.plan.id, "main").is_empty());
    assert_eq!(summary(&messages).failed_paths, vec!["ghost.txt", "new.txt"]);
}

#[tokio::test]
async fn write_after_move_to_destination_wins() {
    let f = Fixture::new();
    f.store
        .add_file_context(f.plan.id, "main", "a.go", "package a\n");

    let reply = Uuid::new_v4();
    let messages = f
        .run(vec![
            ActiveBuild::new(
                reply,
                "a.go",
                BuildKind::Move {
                    destination: "b.go".into(),
                },
            ),
            ActiveBuild::edit(reply, "b.go", "package b\n"),
        ])
        .await;

    assert_eq!(f.current("b.go").await.as_deref(), Some("package b\n"));
    assert_eq!(f.current("a.go").await, None);
    assert_eq!(contents_of(&f, "b.go"), vec!["package a\n", "package b\n"]);
    assert_eq!(finished_for(&messages, "b.go").len(), 2);
    assert!(summary(&messages).failed_paths.is_empty());
}

#[tokio::test]
async fn move_waits_for_earlier_edits_of_its_source() {
    let f = Fixture::new();
    f.store
        .add_file_context(f.plan.id, "main", "a.go", "package a\n");

    let reply = Uuid::new_v4();
    f.run(vec![
        ActiveBuild::edit(reply, "a.go", "package a\n\nfunc A() {}\n"),
        ActiveBuild::new(
            reply,
            "a.go",
            BuildKind::Move {
                destination: "b.go".into(),
            },
        ),
    ])
    .await;

    assert_eq!(
        f.current("b.go").await.as_deref(),
        Some("package a\n\nfunc A() {}\n")
    );
    assert_eq!(f.current("a.go").await, None);
}

#[tokio::test]
async fn remove_stores_a_removal() {
    let f = Fixture::new();
    f.store.add_file_context(f.plan.id, "main", "a.txt", "x");

    let messages = f
        .run(vec![ActiveBuild::new(Uuid::new_v4(), "a.txt", BuildKind::Remove)])
        .await;

    let results = f.store.file_results(f.plan.id, "main");
    assert_eq!(results.len(), 1);
    assert!(results[0].removed_file);
    assert!(finished_for(&messages, "a.txt")[0].removed);
}

#[tokio::test]
async fn reset_restores_last_applied_version() {
    let f = Fixture::new();
    f.store.store_file_result(f.result("a.txt", "v0")).await.unwrap();
    f.store.apply_results(f.plan.id, "main").await.unwrap();
    f.store.store_file_result(f.result("a.txt", "v1")).await.unwrap();
    assert_eq!(f.current("a.txt").await.as_deref(), Some("v1"));

    let messages = f
        .run(vec![ActiveBuild::new(Uuid::new_v4(), "a.txt", BuildKind::Reset)])
        .await;

    assert_eq!(f.current("a.txt").await.as_deref(), Some("v0"));
    let finished = finished_for(&messages, "a.txt");
    assert_eq!(finished.len(), 1);
    assert!(!finished[0].removed);
}

#[tokio::test]
async fn reset_of_never_applied_file_reports_removed() {
    let f = Fixture::new();
    f.store.store_file_result(f.result("draft.txt", "v1")).await.unwrap();

    let messages = f
        .run(vec![ActiveBuild::new(Uuid::new_v4(), "draft.txt", BuildKind::Reset)])
        .await;

    assert_eq!(f.current("draft.txt").await, None);
    let finished = finished_for(&messages, "draft.txt");
    assert_eq!(finished.len(), 1);
    assert!(finished[0].removed);
}

#[tokio::test]
async fn reset_times_out_while_build_lock_is_read_held() {
    let f = Fixture::new();
    f.store.store_file_result(f.result("a.txt", "v1")).await.unwrap();

    let mut sub = f.activate().await;
    let key = f.key();
    let guard = f
        .registry
        .lock_for_read(&key, Duration::from_secs(1))
        .await
        .unwrap();

    f.builder
        .queue_build(&key, ActiveBuild::new(Uuid::new_v4(), "a.txt", BuildKind::Reset));
    let messages = f.finish(&mut sub).await;
    drop(guard);

    assert_eq!(errors_for(&messages, "a.txt"), 1);
    assert!(finished_for(&messages, "a.txt").is_empty());
    assert_eq!(f.current("a.txt").await.as_deref(), Some("v1"));
}

// ===========================================================================
// Failures
// ===========================================================================

#[tokio::test]
async fn failed_build_does_not_stop_other_builds() {
    let f = Fixture::new();
    f.store.fail_writes_for("bad.txt");
    let reply = Uuid::new_v4();

    let messages = f
        .run(vec![
            ActiveBuild::edit(reply, "bad.txt", "x"),
            ActiveBuild::edit(reply, "good.txt", "y"),
            ActiveBuild::new(reply, "bad.txt", BuildKind::Reset),
        ])
        .await;

    assert_eq!(errors_for(&messages, "bad.txt"), 1);
    // The reset queued behind the failure still ran.
    assert_eq!(finished_for(&messages, "bad.txt").len(), 1);
    assert_eq!(f.current("good.txt").await.as_deref(), Some("y"));

    let summary = summary(&messages);
    assert_eq!(summary.builds, 3);
    assert!(summary.failed_paths.is_empty());
}

#[tokio::test]
async fn failing_path_is_reported_in_summary() {
    let f = Fixture::new();
    f.store.fail_writes_for("bad.txt");
    let reply = Uuid::new_v4();

    let messages = f
        .run(vec![
            ActiveBuild::edit(reply, "bad.txt", "x"),
            ActiveBuild::edit(reply, "good.txt", "y"),
        ])
        .await;

    let summary = summary(&messages);
    assert_eq!(summary.failed_paths, vec!["bad.txt"]);
    assert_eq!(summary.built_files, vec!["good.txt"]);
}

// ===========================================================================
// Pending builds
// ===========================================================================

#[tokio::test]
async fn build_pending_builds_each_unbuilt_reply_once() {
    use plansmith_core::Operation;

    let f = Fixture::new();
    f.store
        .add_reply(f.plan.id, "main", "r1", 1, &[Operation::file("a.txt", "a\n")])
        .await
        .unwrap();
    f.store
        .add_reply(f.plan.id, "main", "r2", 1, &[Operation::file("b.txt", "b\n")])
        .await
        .unwrap();

    let (queued, mut sub) = f.builder.build_pending(f.plan.id, "main").await.unwrap();
    assert_eq!(queued, 2);
    tokio::time::timeout(Duration::from_secs(5), sub.done.cancelled())
        .await
        .expect("plan did not finish");

    assert_eq!(f.current("a.txt").await.as_deref(), Some("a\n"));
    assert_eq!(f.current("b.txt").await.as_deref(), Some("b\n"));
    assert_eq!(f.store.plan_builds(f.plan.id, "main").len(), 2);
    assert!(matches!(drain(&mut sub.messages).last(), Some(StreamMessage::Finished(_))));

    let (queued, mut sub) = f.builder.build_pending(f.plan.id, "main").await.unwrap();
    assert_eq!(queued, 0);
    assert!(sub.done.is_cancelled());
    let messages = drain(&mut sub.messages);
    assert_eq!(summary(&messages).builds, 0);
}

// ===========================================================================
// Concurrency
// ===========================================================================

/// Records how many edits run at once and the order they were applied in.
#[derive(Default)]
struct CountingEdits {
    running: AtomicUsize,
    max_running: AtomicUsize,
    applied: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl StructuredEdits for CountingEdits {
    async fn apply(&self, _path: &str, original: &str, proposed: &str) -> anyhow::Result<String> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.applied
            .lock()
            .unwrap()
            .push((original.to_string(), proposed.to_string()));
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(proposed.to_string())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_worker_per_path_under_concurrent_queueing() {
    const TASKS: usize = 8;
    const PER_TASK: usize = 10;

    let edits = Arc::new(CountingEdits::default());
    let f = Fixture::with_edits(edits.clone());
    f.store
        .add_file_context(f.plan.id, "main", "shared.txt", "seed\n");
    let mut sub = f.activate().await;
    let key = f.key();

    let mut tasks = Vec::new();
    for task in 0..TASKS {
        let builder = Arc::clone(&f.builder);
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let reply = Uuid::new_v4();
            for n in 0..PER_TASK {
                let build = ActiveBuild::edit(reply, "shared.txt", format!("{task}-{n}\n"));
                assert!(builder.queue_build(&key, build));
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    let messages = f.finish(&mut sub).await;

    assert_eq!(edits.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(summary(&messages).builds, TASKS * PER_TASK);

    let applied = edits.applied.lock().unwrap().clone();
    assert_eq!(applied.len(), TASKS * PER_TASK);
    // Each edit saw the result of the one before it.
    assert_eq!(applied[0].0, "seed\n");
    for pair in applied.windows(2) {
        assert_eq!(pair[1].0, pair[0].1);
    }
    // Builds queued by one task ran in the order that task queued them.
    for task in 0..TASKS {
        let prefix = format!("{task}-");
        let order: Vec<usize> = applied
            .iter()
            .filter_map(|(_, proposed)| proposed.strip_prefix(&prefix))
            .map(|n| n.trim_end().parse().unwrap())
            .collect();
        assert_eq!(order, (0..PER_TASK).collect::<Vec<_>>());
    }

    let stored = contents_of(&f, "shared.txt");
    let proposed: Vec<String> = applied.into_iter().map(|(_, p)| p).collect();
    assert_eq!(stored, proposed);
}
