//! Database query functions for the `convo_messages` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ConvoMessage, ConvoRole};

/// Parameters for inserting a conversation message.
#[derive(Debug, Clone)]
pub struct NewConvoMessage<'a> {
    pub plan_id: Uuid,
    pub branch: &'a str,
    pub role: ConvoRole,
    pub message: &'a str,
    pub num_tokens: i32,
    pub operations: Value,
}

/// Insert a conversation message.
pub async fn insert_message(pool: &PgPool, new: &NewConvoMessage<'_>) -> Result<ConvoMessage> {
    let msg = sqlx::query_as::<_, ConvoMessage>(
        "INSERT INTO convo_messages (plan_id, branch, role, message, num_tokens, operations) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.plan_id)
    .bind(new.branch)
    .bind(new.role)
    .bind(new.message)
    .bind(new.num_tokens)
    .bind(&new.operations)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert {} message for plan {}", new.role, new.plan_id))?;

    Ok(msg)
}

/// List the conversation of a branch, oldest first.
pub async fn list_messages(pool: &PgPool, plan_id: Uuid, branch: &str) -> Result<Vec<ConvoMessage>> {
    let rows = sqlx::query_as::<_, ConvoMessage>(
        "SELECT * FROM convo_messages WHERE plan_id = $1 AND branch = $2 \
         ORDER BY created_at ASC",
    )
    .bind(plan_id)
    .bind(branch)
    .fetch_all(pool)
    .await
    .context("failed to list convo messages")?;

    Ok(rows)
}

/// Assistant replies whose operations have not been built yet, oldest first.
pub async fn list_unbuilt_replies(
    pool: &PgPool,
    plan_id: Uuid,
    branch: &str,
) -> Result<Vec<ConvoMessage>> {
    let rows = sqlx::query_as::<_, ConvoMessage>(
        "SELECT * FROM convo_messages \
         WHERE plan_id = $1 AND branch = $2 AND role = 'assistant' AND NOT did_build \
         ORDER BY created_at ASC",
    )
    .bind(plan_id)
    .bind(branch)
    .fetch_all(pool)
    .await
    .context("failed to list unbuilt replies")?;

    Ok(rows)
}

/// Flag a reply as built.
pub async fn mark_built(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE convo_messages SET did_build = true WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to mark convo message {id} built"))?;

    Ok(())
}
