//! Throwaway PostgreSQL databases for the plansmith store tests.
//!
//! Set `PLANSMITH_TEST_PG_URL` to a server root URL (no database name) to
//! use an existing server. Otherwise one `postgres:16` container is started
//! per test binary. Without either, [`TestDb::create`] returns `None` and the
//! test skips itself.

use std::path::Path;

use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use plansmith_db::pool;

pub const TEST_PG_URL_VAR: &str = "PLANSMITH_TEST_PG_URL";

struct Server {
    root_url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<Server> = OnceCell::const_new();

fn server_reachable() -> bool {
    std::env::var(TEST_PG_URL_VAR).is_ok()
        || std::env::var("DOCKER_HOST").is_ok()
        || Path::new("/var/run/docker.sock").exists()
}

async fn start_server() -> Server {
    if let Ok(root_url) = std::env::var(TEST_PG_URL_VAR) {
        return Server {
            root_url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("16")
        .start()
        .await
        .expect("failed to start postgres container");
    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("container port");
    Server {
        root_url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _container: Some(container),
    }
}

async fn maintenance_pool() -> PgPool {
    let server = SERVER.get_or_init(start_server).await;
    pool::connect(&format!("{}/postgres", server.root_url), 1)
        .await
        .expect("connect to maintenance database")
}

/// A migrated database private to one test.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    /// Create and migrate a fresh database, or `None` when no server can be
    /// reached.
    pub async fn create() -> Option<Self> {
        if !server_reachable() {
            eprintln!("skipping database test: set {TEST_PG_URL_VAR} or start Docker");
            return None;
        }

        let name = format!("plansmith_test_{}", Uuid::new_v4().simple());
        let maintenance = maintenance_pool().await;
        pool::create_database(&maintenance, &name)
            .await
            .expect("create test database");
        maintenance.close().await;

        let server = SERVER.get().expect("server started above");
        let pool = pool::connect(&format!("{}/{name}", server.root_url), 5)
            .await
            .expect("connect to test database");
        pool::run_migrations(&pool).await.expect("migrate test database");
        Some(Self { pool, name })
    }

    /// Close the pool and drop the database.
    pub async fn finish(self) {
        self.pool.close().await;
        let maintenance = maintenance_pool().await;
        if let Err(err) = pool::drop_database(&maintenance, &self.name).await {
            eprintln!("leaving test database {} behind: {err:#}", self.name);
        }
        maintenance.close().await;
    }
}
