//! `plansmith plan`, `context` and `subtask` commands.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use sqlx::PgPool;
use uuid::Uuid;

use plansmith_core::tokens;
use plansmith_db::models::ContextType;
use plansmith_db::queries::contexts::{self, NewContext};
use plansmith_db::queries::{plans, subtasks};

use crate::{ContextCommands, PlanCommands, SubtaskCommands};

pub fn parse_plan_id(plan_id: &str) -> Result<Uuid> {
    Uuid::parse_str(plan_id).with_context(|| format!("invalid plan ID: {plan_id}"))
}

/// Dispatch a `plan` subcommand.
pub async fn run_plan_command(command: PlanCommands, pool: &PgPool) -> Result<()> {
    match command {
        PlanCommands::Create {
            name,
            project_path,
            branch,
        } => {
            let plan = plans::insert_plan(pool, &name, &project_path, &branch).await?;
            println!("Created plan {:?} ({})", plan.name, plan.id);
            println!("  branch: {branch}");
            println!();
            println!("Next: add files with `plansmith context add {} <files..>`.", plan.id);
        }
        PlanCommands::List => {
            let all = plans::list_plans(pool).await?;
            if all.is_empty() {
                println!("No plans.");
                return Ok(());
            }
            for plan in &all {
                println!(
                    "{}  {}  (created {})",
                    plan.id,
                    plan.name,
                    plan.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
    }
    Ok(())
}

/// Dispatch a `context` subcommand.
pub async fn run_context_command(command: ContextCommands, pool: &PgPool) -> Result<()> {
    match command {
        ContextCommands::Add {
            plan_id,
            files,
            branch,
            note,
        } => {
            let plan_id = parse_plan_id(&plan_id)?;
            plans::get_plan(pool, plan_id)
                .await?
                .with_context(|| format!("plan {plan_id} not found"))?;
            plans::ensure_branch(pool, plan_id, &branch).await?;

            let mut total = 0;
            for file in &files {
                total += add_file(pool, plan_id, &branch, file).await?;
            }
            if let Some(note) = note {
                let ctx = contexts::insert_context(
                    pool,
                    &NewContext {
                        plan_id,
                        branch: &branch,
                        context_type: ContextType::Note,
                        name: "note",
                        file_path: "",
                        url: "",
                        body: &note,
                        num_tokens: saturating_i32(tokens::estimate(&note)),
                    },
                )
                .await?;
                println!("  + note ({} tokens)", ctx.num_tokens);
                total += tokens::estimate(&note);
            }
            println!("Added context to {plan_id}@{branch}: {total} tokens.");
        }
        ContextCommands::List { plan_id, branch } => {
            let plan_id = parse_plan_id(&plan_id)?;
            let rows = contexts::list_contexts(pool, plan_id, &branch).await?;
            if rows.is_empty() {
                println!("No context loaded for {plan_id}@{branch}.");
                return Ok(());
            }
            let mut total = 0i64;
            for ctx in &rows {
                let label = match ctx.context_type {
                    ContextType::File | ContextType::Map | ContextType::DirectoryTree => {
                        ctx.file_path.as_str()
                    }
                    ContextType::Url => ctx.url.as_str(),
                    ContextType::Note | ContextType::Image => ctx.name.as_str(),
                };
                println!("  [{}] {} ({} tokens)", ctx.context_type, label, ctx.num_tokens);
                total += i64::from(ctx.num_tokens);
            }
            println!("Total: {total} tokens");
        }
    }
    Ok(())
}

/// Dispatch a `subtask` subcommand.
pub async fn run_subtask_command(command: SubtaskCommands, pool: &PgPool) -> Result<()> {
    match command {
        SubtaskCommands::Add {
            plan_id,
            title,
            description,
            files,
            branch,
        } => {
            let plan_id = parse_plan_id(&plan_id)?;
            plans::ensure_branch(pool, plan_id, &branch).await?;
            let position = subtasks::list_subtasks(pool, plan_id, &branch).await?.len() + 1;
            let subtask = subtasks::insert_subtask(
                pool,
                plan_id,
                &branch,
                saturating_i32(position),
                &title,
                description.as_deref().unwrap_or(""),
                &files,
            )
            .await?;
            println!("Added subtask {}. {} ({})", subtask.position, subtask.title, subtask.id);
        }
        SubtaskCommands::List { plan_id, branch } => {
            let plan_id = parse_plan_id(&plan_id)?;
            let rows = subtasks::list_subtasks(pool, plan_id, &branch).await?;
            if rows.is_empty() {
                println!("No subtasks for {plan_id}@{branch}.");
            }
            for task in &rows {
                let icon = if task.is_finished { "+" } else { "." };
                println!("  [{icon}] {}. {} ({})", task.position, task.title, task.id);
                if !task.uses_files.is_empty() {
                    println!("        files: {}", task.uses_files.join(", "));
                }
            }
        }
        SubtaskCommands::Finish { subtask_id } => {
            let id = Uuid::parse_str(&subtask_id)
                .with_context(|| format!("invalid subtask ID: {subtask_id}"))?;
            subtasks::finish_subtask(pool, id).await?;
            println!("Subtask {id} finished.");
        }
    }
    Ok(())
}

async fn add_file(pool: &PgPool, plan_id: Uuid, branch: &str, file: &PathBuf) -> Result<usize> {
    let body = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let path = file.to_string_lossy();
    let num_tokens = tokens::estimate(&body);

    contexts::insert_context(
        pool,
        &NewContext {
            plan_id,
            branch,
            context_type: ContextType::File,
            name: &path,
            file_path: &path,
            url: "",
            body: &body,
            num_tokens: saturating_i32(num_tokens),
        },
    )
    .await?;
    tracing::debug!(plan_id = %plan_id, path = %path, num_tokens, "file context added");
    println!("  + {path} ({num_tokens} tokens)");
    Ok(num_tokens)
}

fn saturating_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
