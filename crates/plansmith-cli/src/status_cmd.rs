//! `plansmith status`, `files`, `build`, `apply` and `reject` commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;

use plansmith_core::build::ReferenceMerge;
use plansmith_core::store::PgPlanStore;
use plansmith_core::{ActivePlanRegistry, Builder, EngineConfig, StreamMessage};
use plansmith_db::models::{ConvoRole, PlanFileResult};
use plansmith_db::queries::{contexts, convo, file_results, plans as plan_db, subtasks};

use crate::plan_cmds::parse_plan_id;
use crate::replay_cmd::describe;

/// Run the status command.
///
/// When `plan_id_str` is `Some`, shows the branch of that plan in detail.
/// When `None`, lists every plan with the status of `branch`.
pub async fn run_status(pool: &PgPool, plan_id_str: Option<&str>, branch: &str) -> Result<()> {
    match plan_id_str {
        Some(id_str) => run_plan_status(pool, id_str, branch).await,
        None => run_all_status(pool, branch).await,
    }
}

async fn run_plan_status(pool: &PgPool, plan_id_str: &str, branch: &str) -> Result<()> {
    let plan_id = parse_plan_id(plan_id_str)?;
    let plan = plan_db::get_plan(pool, plan_id)
        .await?
        .with_context(|| format!("plan {plan_id} not found"))?;
    let branch_row = plan_db::get_branch(pool, plan_id, branch)
        .await?
        .with_context(|| format!("plan {plan_id} has no branch {branch:?}"))?;

    println!("Plan: {} ({})", plan.name, plan.id);
    println!("Project: {}", plan.project_path);
    println!("Branch: {} [{}]", branch_row.name, branch_row.status);
    if let Some(error) = &branch_row.error {
        println!("Error: {error}");
    }
    println!(
        "Updated: {}",
        branch_row.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();

    let ctxs = contexts::list_contexts(pool, plan_id, branch).await?;
    let context_tokens: i64 = ctxs.iter().map(|c| i64::from(c.num_tokens)).sum();
    println!("Context: {} item(s), {context_tokens} tokens", ctxs.len());

    let messages = convo::list_messages(pool, plan_id, branch).await?;
    let replies = messages
        .iter()
        .filter(|m| m.role == ConvoRole::Assistant)
        .count();
    let unbuilt = convo::list_unbuilt_replies(pool, plan_id, branch).await?;
    println!(
        "Conversation: {} message(s), {replies} repl(ies), {} unbuilt",
        messages.len(),
        unbuilt.len()
    );

    let tasks = subtasks::list_subtasks(pool, plan_id, branch).await?;
    if !tasks.is_empty() {
        println!();
        println!("Subtasks:");
        for task in &tasks {
            let icon = if task.is_finished { "+" } else { "." };
            println!("  [{icon}] {}. {}", task.position, task.title);
        }
    }

    let files = file_results::current_files(pool, plan_id, branch).await?;
    println!();
    if files.is_empty() {
        println!("No built files.");
    } else {
        println!("Files:");
        for path in files.keys() {
            println!("  {path}");
        }
    }

    Ok(())
}

async fn run_all_status(pool: &PgPool, branch: &str) -> Result<()> {
    let plans = plan_db::list_plans(pool).await?;
    if plans.is_empty() {
        println!("No plans found.");
        return Ok(());
    }

    println!("{:<38} {:<30} {:<10} {:>6}", "ID", "NAME", "STATUS", "FILES");
    println!("{}", "-".repeat(87));

    for plan in &plans {
        let status = match plan_db::get_branch(pool, plan.id, branch).await? {
            Some(row) => row.status.to_string(),
            None => "-".to_string(),
        };
        let files = file_results::current_files(pool, plan.id, branch).await?;
        println!(
            "{:<38} {:<30} {:<10} {:>6}",
            plan.id,
            truncate(&plan.name, 28),
            status,
            files.len()
        );
    }

    Ok(())
}

/// List the current files of a branch, or the result history of one path.
pub async fn run_files(
    pool: &PgPool,
    plan_id_str: &str,
    branch: &str,
    path: Option<&str>,
) -> Result<()> {
    let plan_id = parse_plan_id(plan_id_str)?;

    let Some(path) = path else {
        let files = file_results::current_files(pool, plan_id, branch).await?;
        if files.is_empty() {
            println!("No built files for {plan_id}@{branch}.");
        }
        for (path, content) in &files {
            println!("{path:<60} {:>8} bytes", content.len());
        }
        return Ok(());
    };

    let history = file_results::list_results_for_path(pool, plan_id, branch, path).await?;
    if history.is_empty() {
        println!("No results for {path}.");
        return Ok(());
    }
    println!("History of {path}:");
    for result in &history {
        println!(
            "  #{:<6} {}  {:<8} {}",
            result.id,
            result.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            result_state(result),
            if result.removed_file {
                "removed".to_string()
            } else {
                format!("{} bytes", result.content.len())
            }
        );
    }
    Ok(())
}

fn result_state(result: &PlanFileResult) -> &'static str {
    if result.rejected_at.is_some() {
        "rejected"
    } else if result.applied_at.is_some() {
        "applied"
    } else {
        "pending"
    }
}

/// Build every stored reply on the branch that has not been built yet.
pub async fn run_build(
    pool: &PgPool,
    plan_id_str: &str,
    branch: &str,
    engine: &EngineConfig,
) -> Result<()> {
    let plan_id = parse_plan_id(plan_id_str)?;
    let store = Arc::new(PgPlanStore::new(pool.clone()));
    let builder = Builder::new(
        Arc::new(ActivePlanRegistry::new()),
        store,
        Arc::new(ReferenceMerge),
        engine,
    );

    let (queued, mut subscription) = builder.build_pending(plan_id, branch).await?;
    if queued == 0 {
        println!("Nothing to build for {plan_id}@{branch}.");
    } else {
        println!("Building {queued} operation(s) for {plan_id}@{branch}...");
    }

    let mut failed = false;
    loop {
        tokio::select! {
            biased;
            Some(message) = subscription.messages.recv() => {
                failed |= matches!(message, StreamMessage::Error { path: None, .. });
                if let Some(line) = describe(&message) {
                    println!("{line}");
                }
            }
            _ = subscription.done.cancelled() => break,
        }
    }
    while let Ok(message) = subscription.messages.try_recv() {
        failed |= matches!(message, StreamMessage::Error { path: None, .. });
        if let Some(line) = describe(&message) {
            println!("{line}");
        }
    }

    if failed {
        anyhow::bail!("build of {plan_id}@{branch} failed");
    }
    Ok(())
}

/// Accept every pending result on the branch.
pub async fn run_apply(pool: &PgPool, plan_id_str: &str, branch: &str) -> Result<()> {
    let plan_id = parse_plan_id(plan_id_str)?;
    let applied = file_results::apply_pending(pool, plan_id, branch).await?;
    tracing::info!(plan_id = %plan_id, branch, applied, "applied pending results");
    println!("Applied {applied} pending result(s) on {plan_id}@{branch}.");
    Ok(())
}

/// Reject the pending results of one path.
pub async fn run_reject(pool: &PgPool, plan_id_str: &str, branch: &str, path: &str) -> Result<()> {
    let plan_id = parse_plan_id(plan_id_str)?;
    let rejected = file_results::reject_path(pool, plan_id, branch, path).await?;
    tracing::info!(plan_id = %plan_id, branch, path, rejected, "rejected pending results");
    println!("Rejected {rejected} pending result(s) for {path}.");
    Ok(())
}

fn truncate(name: &str, max: usize) -> String {
    if name.chars().count() > max {
        let head: String = name.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        name.to_string()
    }
}
