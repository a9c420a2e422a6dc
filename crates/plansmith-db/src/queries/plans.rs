//! Database query functions for the `plans` and `plan_branches` tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Plan, PlanBranch, PlanStatus};

/// Insert a new plan row together with its initial branch.
pub async fn insert_plan(
    pool: &PgPool,
    name: &str,
    project_path: &str,
    branch: &str,
) -> Result<Plan> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let plan = sqlx::query_as::<_, Plan>(
        "INSERT INTO plans (name, project_path) VALUES ($1, $2) RETURNING *",
    )
    .bind(name)
    .bind(project_path)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert plan")?;

    sqlx::query("INSERT INTO plan_branches (plan_id, name) VALUES ($1, $2)")
        .bind(plan.id)
        .bind(branch)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert branch {branch:?} for plan {}", plan.id))?;

    tx.commit().await.context("failed to commit transaction")?;

    Ok(plan)
}

/// Fetch a plan by its ID.
pub async fn get_plan(pool: &PgPool, id: Uuid) -> Result<Option<Plan>> {
    let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch plan")?;

    Ok(plan)
}

/// List all plans, newest first.
pub async fn list_plans(pool: &PgPool) -> Result<Vec<Plan>> {
    let plans = sqlx::query_as::<_, Plan>("SELECT * FROM plans ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list plans")?;

    Ok(plans)
}

/// Create the branch row if it does not exist yet.
pub async fn ensure_branch(pool: &PgPool, plan_id: Uuid, branch: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO plan_branches (plan_id, name) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(plan_id)
    .bind(branch)
    .execute(pool)
    .await
    .with_context(|| format!("failed to ensure branch {branch:?} for plan {plan_id}"))?;

    Ok(())
}

/// Fetch one branch of a plan.
pub async fn get_branch(pool: &PgPool, plan_id: Uuid, branch: &str) -> Result<Option<PlanBranch>> {
    let row = sqlx::query_as::<_, PlanBranch>(
        "SELECT * FROM plan_branches WHERE plan_id = $1 AND name = $2",
    )
    .bind(plan_id)
    .bind(branch)
    .fetch_optional(pool)
    .await
    .context("failed to fetch plan branch")?;

    Ok(row)
}

/// Update the status (and error text) of a branch.
pub async fn set_branch_status(
    pool: &PgPool,
    plan_id: Uuid,
    branch: &str,
    status: PlanStatus,
    error: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE plan_branches SET status = $1, error = $2, updated_at = now() \
         WHERE plan_id = $3 AND name = $4",
    )
    .bind(status)
    .bind(error)
    .bind(plan_id)
    .bind(branch)
    .execute(pool)
    .await
    .context("failed to update plan status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("branch {branch:?} of plan {plan_id} not found");
    }

    Ok(())
}
