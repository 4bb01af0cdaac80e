//! Storage engine (component A) and schema/migration bootstrap (component B).
//!
//! A single `sqlx::SqlitePool` backs the whole subsystem. The trading core
//! is single-writer-per-service-instance; we rely on SQLite's own locking
//! plus a generous `busy_timeout` rather than a second pool.

pub mod migrations;
pub mod schema;

use crate::error::{Result, ScoundrelError};
use sqlx::sqlite::{SqlitePoolOptions, SqliteConnectOptions};
use sqlx::Pool;
use sqlx::Sqlite;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// Open (creating if necessary) the database at `url`, apply the
    /// required pragmas, bootstrap the schema, and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(url)
            .map_err(|e| ScoundrelError::Validation(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;

        Self::apply_pragmas(&pool).await?;
        schema::ensure_schema(&pool).await?;
        migrations::run_migrations(&pool).await?;

        info!("connected to {}", url);
        Ok(Self { pool })
    }

    async fn apply_pragmas(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query("PRAGMA journal_mode = WAL;").execute(pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL;").execute(pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(pool).await?;
        sqlx::query("PRAGMA foreign_keys = ON;").execute(pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
