//! Database query functions for the `contexts` table.

use anyhow::{Context as _, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Context, ContextType};

/// Parameters for inserting a context row.
#[derive(Debug, Clone)]
pub struct NewContext<'a> {
    pub plan_id: Uuid,
    pub branch: &'a str,
    pub context_type: ContextType,
    pub name: &'a str,
    pub file_path: &'a str,
    pub url: &'a str,
    pub body: &'a str,
    pub num_tokens: i32,
}

/// Insert a context row.
pub async fn insert_context(pool: &PgPool, new: &NewContext<'_>) -> Result<Context> {
    let ctx = sqlx::query_as::<_, Context>(
        "INSERT INTO contexts \
         (plan_id, branch, context_type, name, file_path, url, body, num_tokens) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.plan_id)
    .bind(new.branch)
    .bind(new.context_type)
    .bind(new.name)
    .bind(new.file_path)
    .bind(new.url)
    .bind(new.body)
    .bind(new.num_tokens)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert {} context {:?}", new.context_type, new.name))?;

    Ok(ctx)
}

/// List the contexts of a branch in insertion order.
pub async fn list_contexts(pool: &PgPool, plan_id: Uuid, branch: &str) -> Result<Vec<Context>> {
    let rows = sqlx::query_as::<_, Context>(
        "SELECT * FROM contexts WHERE plan_id = $1 AND branch = $2 \
         ORDER BY created_at ASC, id ASC",
    )
    .bind(plan_id)
    .bind(branch)
    .fetch_all(pool)
    .await
    .context("failed to list contexts")?;

    Ok(rows)
}
