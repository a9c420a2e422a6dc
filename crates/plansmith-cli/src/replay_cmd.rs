//! `plansmith replay`: stream a recorded reply through the engine.
//!
//! The reply is fed to the tell pipeline as if a model had produced it, so
//! its operations are parsed and built exactly as a live reply would be.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use plansmith_core::provider::ReplayProvider;
use plansmith_core::store::{MemoryPlanStore, PlanStore};
use plansmith_core::{EngineConfig, Orchestrator, StreamMessage, TellOutcome, TellRequest, TellStage};

pub struct ReplayOptions {
    pub branch: String,
    pub prompt: String,
    pub stage: TellStage,
    pub chunk_size: usize,
    pub auto_build: bool,
    pub json: bool,
}

/// Replay `reply_file` against `plan_id`, printing streamed messages as they
/// arrive. Returns once the reply and all of its builds have finished.
pub async fn run_replay(
    store: Arc<dyn PlanStore>,
    plan_id: Uuid,
    reply_file: &Path,
    opts: &ReplayOptions,
    engine: EngineConfig,
) -> Result<TellOutcome> {
    let reply = std::fs::read_to_string(reply_file)
        .with_context(|| format!("failed to read reply file {}", reply_file.display()))?;
    let provider = Arc::new(ReplayProvider::from_reply(&reply, opts.chunk_size.max(1)));
    let orchestrator = Orchestrator::new(store, provider, engine);

    let mut request = TellRequest::new(plan_id, opts.branch.clone(), opts.prompt.clone());
    request.stage = opts.stage;
    request.auto_build = opts.auto_build;

    let mut handle = orchestrator.start_tell(request).await?;
    tracing::debug!(plan = %handle.key, file = %reply_file.display(), "replay started");

    loop {
        tokio::select! {
            biased;
            Some(message) = handle.messages.recv() => print_message(&message, opts.json)?,
            _ = handle.done.cancelled() => break,
        }
    }

    let (result, rest) = handle.wait().await;
    for message in &rest {
        print_message(message, opts.json)?;
    }
    Ok(result?)
}

/// Replay against a throwaway in-memory plan seeded with `context_files`,
/// then print the resulting files.
pub async fn run_dry_run(
    reply_file: &Path,
    context_files: &[PathBuf],
    opts: &ReplayOptions,
    engine: EngineConfig,
) -> Result<()> {
    let store = Arc::new(MemoryPlanStore::new());
    let plan = store.create_plan("dry-run", &opts.branch);
    for file in context_files {
        let body = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        store.add_file_context(plan.id, &opts.branch, &file.to_string_lossy(), &body);
    }

    let outcome = run_replay(store.clone(), plan.id, reply_file, opts, engine).await?;
    if opts.json {
        return Ok(());
    }

    print_outcome(&outcome);
    let files = store.current_plan_files(plan.id, &opts.branch).await?;
    if files.is_empty() {
        println!("No files built.");
        return Ok(());
    }
    for (path, content) in &files {
        println!();
        println!("==> {path} <==");
        print!("{content}");
        if !content.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

pub fn print_outcome(outcome: &TellOutcome) {
    println!();
    println!(
        "Reply {}: {} operation(s), {} build(s) queued, {} attempt(s), ~{} prompt tokens",
        outcome.reply_id,
        outcome.operations.len(),
        outcome.queued_builds,
        outcome.attempts,
        outcome.prompt_tokens
    );
}

fn print_message(message: &StreamMessage, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(message)?);
    } else if let Some(line) = describe(message) {
        println!("{line}");
    }
    Ok(())
}

/// One human-readable line per message. Reply chunks and in-progress build
/// updates are too noisy to print.
pub fn describe(message: &StreamMessage) -> Option<String> {
    match message {
        StreamMessage::Reply { .. } => None,
        StreamMessage::BuildInfo(info) if !info.finished => None,
        StreamMessage::BuildInfo(info) if info.removed => Some(format!("  - {}", info.path)),
        StreamMessage::BuildInfo(info) => {
            Some(format!("  + {} ({} tokens)", info.path, info.num_tokens))
        }
        StreamMessage::Retrying { attempt, error } => {
            Some(format!("retrying (attempt {attempt}): {error}"))
        }
        StreamMessage::Error {
            path: Some(path),
            message,
        } => Some(format!("  ! {path}: {message}")),
        StreamMessage::Error { path: None, message } => Some(format!("error: {message}")),
        StreamMessage::Finished(summary) => {
            let mut line = format!(
                "finished: {} build(s), {} file(s) built",
                summary.builds,
                summary.built_files.len()
            );
            if !summary.failed_paths.is_empty() {
                line.push_str(&format!(", failed: {}", summary.failed_paths.join(", ")));
            }
            Some(line)
        }
        StreamMessage::Stopped => Some("stopped".to_string()),
    }
}

pub fn require_plan_id(plan: Option<&str>) -> Result<Uuid> {
    match plan {
        Some(id) => crate::plan_cmds::parse_plan_id(id),
        None => bail!("--plan is required unless --dry-run is given"),
    }
}
