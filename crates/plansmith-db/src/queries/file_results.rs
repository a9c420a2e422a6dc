//! Database query functions for the `plan_file_results` table.
//!
//! Results are append-only: content and removal never change after insert.
//! Applying or rejecting only stamps `applied_at` / `rejected_at`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::PlanFileResult;

/// Parameters for inserting a file result.
#[derive(Debug, Clone)]
pub struct NewPlanFileResult {
    pub plan_id: Uuid,
    pub branch: String,
    pub plan_build_id: Option<Uuid>,
    pub convo_message_id: Option<Uuid>,
    pub path: String,
    pub content: String,
    pub removed_file: bool,
}

/// Insert a file result on an existing connection or transaction.
pub async fn insert_file_result(
    conn: &mut PgConnection,
    new: &NewPlanFileResult,
) -> Result<PlanFileResult> {
    let row = sqlx::query_as::<_, PlanFileResult>(
        "INSERT INTO plan_file_results \
         (plan_id, branch, plan_build_id, convo_message_id, path, content, removed_file) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new.plan_id)
    .bind(&new.branch)
    .bind(new.plan_build_id)
    .bind(new.convo_message_id)
    .bind(&new.path)
    .bind(&new.content)
    .bind(new.removed_file)
    .fetch_one(conn)
    .await
    .with_context(|| format!("failed to insert file result for {}", new.path))?;

    Ok(row)
}

/// Insert a file result and touch the branch in one transaction.
pub async fn store_file_result(pool: &PgPool, new: &NewPlanFileResult) -> Result<PlanFileResult> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let row = insert_file_result(&mut tx, new).await?;

    sqlx::query("UPDATE plan_branches SET updated_at = now() WHERE plan_id = $1 AND name = $2")
        .bind(new.plan_id)
        .bind(&new.branch)
        .execute(&mut *tx)
        .await
        .context("failed to touch plan branch")?;

    tx.commit().await.context("failed to commit transaction")?;

    Ok(row)
}

/// Materialize the current files of a branch: the latest non-rejected result
/// per path, with removed paths left out.
pub async fn current_files(
    pool: &PgPool,
    plan_id: Uuid,
    branch: &str,
) -> Result<BTreeMap<String, String>> {
    let rows: Vec<(String, String, bool)> = sqlx::query_as(
        "SELECT DISTINCT ON (path) path, content, removed_file \
         FROM plan_file_results \
         WHERE plan_id = $1 AND branch = $2 AND rejected_at IS NULL \
         ORDER BY path, id DESC",
    )
    .bind(plan_id)
    .bind(branch)
    .fetch_all(pool)
    .await
    .context("failed to load current plan files")?;

    Ok(rows
        .into_iter()
        .filter(|(_, _, removed)| !removed)
        .map(|(path, content, _)| (path, content))
        .collect())
}

/// All results recorded for one path, oldest first.
pub async fn list_results_for_path(
    pool: &PgPool,
    plan_id: Uuid,
    branch: &str,
    path: &str,
) -> Result<Vec<PlanFileResult>> {
    let rows = sqlx::query_as::<_, PlanFileResult>(
        "SELECT * FROM plan_file_results \
         WHERE plan_id = $1 AND branch = $2 AND path = $3 \
         ORDER BY id ASC",
    )
    .bind(plan_id)
    .bind(branch)
    .bind(path)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list file results for {path}"))?;

    Ok(rows)
}

/// Reject every pending result for a path, reverting it to its last
/// accepted state. Returns the number of rejected results.
pub async fn reject_path(pool: &PgPool, plan_id: Uuid, branch: &str, path: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE plan_file_results SET rejected_at = now() \
         WHERE plan_id = $1 AND branch = $2 AND path = $3 \
           AND applied_at IS NULL AND rejected_at IS NULL",
    )
    .bind(plan_id)
    .bind(branch)
    .bind(path)
    .execute(pool)
    .await
    .with_context(|| format!("failed to reject results for {path}"))?;

    Ok(result.rows_affected())
}

/// Accept every pending result of a branch. Returns the number applied.
pub async fn apply_pending(pool: &PgPool, plan_id: Uuid, branch: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE plan_file_results SET applied_at = now() \
         WHERE plan_id = $1 AND branch = $2 \
           AND applied_at IS NULL AND rejected_at IS NULL",
    )
    .bind(plan_id)
    .bind(branch)
    .execute(pool)
    .await
    .context("failed to apply pending results")?;

    Ok(result.rows_affected())
}
