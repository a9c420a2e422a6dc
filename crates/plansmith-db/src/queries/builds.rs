//! Database query functions for the `plan_builds` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::PlanBuild;

/// Insert a build row for an assistant reply.
pub async fn insert_plan_build(
    pool: &PgPool,
    plan_id: Uuid,
    branch: &str,
    convo_message_id: Uuid,
) -> Result<PlanBuild> {
    let build = sqlx::query_as::<_, PlanBuild>(
        "INSERT INTO plan_builds (plan_id, branch, convo_message_id) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(plan_id)
    .bind(branch)
    .bind(convo_message_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert build for message {convo_message_id}"))?;

    Ok(build)
}
