//! In-place column migrations for databases created by an older build.
//!
//! `schema::ensure_schema` already creates every table this crate needs with
//! `CREATE TABLE IF NOT EXISTS`, which covers a brand new database. A
//! database created by an earlier revision may be missing columns added
//! since; each migration here probes `pragma_table_info` before altering,
//! exactly as `trader_evaluator`'s `migrate_*` helpers do, and records its
//! name in `schema_migrations` so it only ever runs once.

use crate::error::Result;
use sqlx::{Pool, Row, Sqlite};

struct ColumnMigration {
    name: &'static str,
    table: &'static str,
    column: &'static str,
    add_clause: &'static str,
}

/// Legacy name -> current name. Consulted before checking/recording a
/// migration's applied status so a rename here doesn't make an already-run
/// migration look unapplied (and get re-run) under its new name.
const LEGACY_NAME_ALIASES: &[(&str, &str)] = &[
    ("trades_session_id", "trades_add_session_id"),
    ("position_runs_strategy_id", "position_runs_add_strategy_id"),
    ("wallets_warchest_flag", "wallets_add_auto_attach_warchest"),
];

fn canonical_name(name: &str) -> &str {
    LEGACY_NAME_ALIASES
        .iter()
        .find(|(legacy, _)| *legacy == name)
        .map(|(_, current)| *current)
        .unwrap_or(name)
}

const COLUMN_MIGRATIONS: &[ColumnMigration] = &[
    ColumnMigration {
        name: "trades_add_session_id",
        table: "trades",
        column: "session_id",
        add_clause: "ALTER TABLE trades ADD COLUMN session_id INTEGER",
    },
    ColumnMigration {
        name: "trades_add_evaluation_payload",
        table: "trades",
        column: "evaluation_payload",
        add_clause: "ALTER TABLE trades ADD COLUMN evaluation_payload TEXT",
    },
    ColumnMigration {
        name: "trades_add_decision_payload",
        table: "trades",
        column: "decision_payload",
        add_clause: "ALTER TABLE trades ADD COLUMN decision_payload TEXT",
    },
    ColumnMigration {
        name: "position_runs_add_strategy_id",
        table: "position_runs",
        column: "strategy_id",
        add_clause: "ALTER TABLE position_runs ADD COLUMN strategy_id TEXT",
    },
    ColumnMigration {
        name: "position_runs_add_source",
        table: "position_runs",
        column: "source",
        add_clause: "ALTER TABLE position_runs ADD COLUMN source TEXT",
    },
    ColumnMigration {
        name: "sessions_add_end_reason",
        table: "sessions",
        column: "end_reason",
        add_clause: "ALTER TABLE sessions ADD COLUMN end_reason TEXT",
    },
    ColumnMigration {
        name: "wallets_add_auto_attach_warchest",
        table: "wallets",
        column: "auto_attach_warchest",
        add_clause: "ALTER TABLE wallets ADD COLUMN auto_attach_warchest INTEGER NOT NULL DEFAULT 0",
    },
];

async fn has_column(pool: &Pool<Sqlite>, table: &str, column: &str) -> Result<bool> {
    let rows = sqlx::query(&format!("SELECT name FROM pragma_table_info('{table}')"))
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .any(|r| r.get::<String, _>("name") == column))
}

async fn already_applied(pool: &Pool<Sqlite>, name: &str) -> Result<bool> {
    let name = canonical_name(name);
    let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

async fn mark_applied(pool: &Pool<Sqlite>, name: &str) -> Result<()> {
    let name = canonical_name(name);
    sqlx::query("INSERT OR IGNORE INTO schema_migrations (name, applied_at) VALUES (?, ?)")
        .bind(name)
        .bind(super::now_ms())
        .execute(pool)
        .await?;
    Ok(())
}

/// Run every column migration that hasn't been recorded yet, probing the
/// live schema before altering so a table already created with the column
/// present (the common case, via `ensure_schema`) is a no-op.
pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    for migration in COLUMN_MIGRATIONS {
        if already_applied(pool, migration.name).await? {
            continue;
        }
        if !has_column(pool, migration.table, migration.column).await? {
            sqlx::query(migration.add_clause).execute(pool).await?;
        }
        mark_applied(pool, migration.name).await?;
    }
    Ok(())
}
