//! Connecting to the plansmith database and keeping its schema current.
//!
//! The CLI opens one pool per command. Build workers and the tell session
//! share it, so it is sized for a few concurrent writers.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::{debug, info};

use crate::config::DbConfig;

/// Migrations from `crates/plansmith-db/migrations/`, embedded at compile time.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a pool of at most `max_connections` against `url`.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(url)
        .await
        .with_context(|| format!("failed to connect to database at {url}"))
}

/// Open the pool used by CLI commands.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    connect(&config.database_url, MAX_CONNECTIONS).await
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run database migrations")?;
    info!(migrations = MIGRATOR.iter().count(), "plansmith schema is up to date");
    Ok(())
}

/// Database names are interpolated into `CREATE DATABASE` and
/// `DROP DATABASE`, so only ASCII letters, digits and `_` are accepted.
pub fn check_database_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        anyhow::bail!("database name {name:?} must be non-empty ASCII letters, digits or '_'");
    }
    Ok(())
}

/// Create database `name` through a connection to the maintenance database.
pub async fn create_database(maintenance: &PgPool, name: &str) -> Result<()> {
    check_database_name(name)?;
    maintenance
        .execute(format!("CREATE DATABASE {name}").as_str())
        .await
        .with_context(|| format!("failed to create database {name}"))?;
    info!(db = name, "database created");
    Ok(())
}

/// Disconnect every session on database `name` and drop it.
pub async fn drop_database(maintenance: &PgPool, name: &str) -> Result<()> {
    check_database_name(name)?;
    sqlx::query(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = $1 AND pid <> pg_backend_pid()",
    )
    .bind(name)
    .execute(maintenance)
    .await
    .with_context(|| format!("failed to disconnect sessions on {name}"))?;
    maintenance
        .execute(format!("DROP DATABASE IF EXISTS {name}").as_str())
        .await
        .with_context(|| format!("failed to drop database {name}"))?;
    debug!(db = name, "database dropped");
    Ok(())
}

/// Create the configured database unless it already exists. Returns `true`
/// if it was created.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<bool> {
    let name = config
        .database_name()
        .context("could not determine database name from URL")?;
    let maintenance = connect(&config.maintenance_url(), 1).await?;

    let created = match database_exists(&maintenance, name).await {
        Ok(true) => {
            debug!(db = name, "database already exists");
            Ok(false)
        }
        Ok(false) => create_database(&maintenance, name).await.map(|()| true),
        Err(err) => Err(err),
    };

    maintenance.close().await;
    created
}

async fn database_exists(maintenance: &PgPool, name: &str) -> Result<bool> {
    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(name)
        .fetch_one(maintenance)
        .await
        .context("failed to query pg_database")
}
