//! Database query functions for the `subtasks` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Subtask;

/// Insert a subtask at the given position.
pub async fn insert_subtask(
    pool: &PgPool,
    plan_id: Uuid,
    branch: &str,
    position: i32,
    title: &str,
    description: &str,
    uses_files: &[String],
) -> Result<Subtask> {
    let subtask = sqlx::query_as::<_, Subtask>(
        "INSERT INTO subtasks (plan_id, branch, position, title, description, uses_files) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(plan_id)
    .bind(branch)
    .bind(position)
    .bind(title)
    .bind(description)
    .bind(uses_files)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert subtask {title:?}"))?;

    Ok(subtask)
}

/// List subtasks of a branch ordered by position.
pub async fn list_subtasks(pool: &PgPool, plan_id: Uuid, branch: &str) -> Result<Vec<Subtask>> {
    let rows = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE plan_id = $1 AND branch = $2 ORDER BY position ASC",
    )
    .bind(plan_id)
    .bind(branch)
    .fetch_all(pool)
    .await
    .context("failed to list subtasks")?;

    Ok(rows)
}

/// Mark a subtask finished.
pub async fn finish_subtask(pool: &PgPool, id: Uuid) -> Result<()> {
    let result = sqlx::query("UPDATE subtasks SET is_finished = true WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to finish subtask")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("subtask {id} not found");
    }

    Ok(())
}
