//! Idempotent schema bootstrap (component B, `ensureSchema`).
//!
//! All tables, indexes and triggers are created with `IF NOT EXISTS` so this
//! can run against an empty database or one created by any earlier version
//! of this crate. Column-add migrations (the only in-place alteration
//! permitted by spec.md §4.1) live in `migrations.rs`, run immediately after
//! this.

use crate::error::Result;
use sqlx::{Pool, Sqlite};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS wallets (
    wallet_id INTEGER PRIMARY KEY AUTOINCREMENT,
    alias TEXT NOT NULL UNIQUE,
    pubkey TEXT NOT NULL,
    usage_type TEXT NOT NULL DEFAULT 'other',
    is_default_funding INTEGER NOT NULL DEFAULT 0,
    auto_attach_warchest INTEGER NOT NULL DEFAULT 0,
    has_private_key INTEGER NOT NULL DEFAULT 0,
    key_source TEXT NOT NULL DEFAULT 'none',
    key_ref TEXT,
    key_ciphertext BLOB
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_wallets_default_funding
    ON wallets(is_default_funding) WHERE is_default_funding = 1;

CREATE TABLE IF NOT EXISTS coins (
    mint TEXT PRIMARY KEY,
    symbol TEXT,
    name TEXT,
    decimals INTEGER,
    price_sol REAL,
    price_usd REAL,
    liquidity_usd REAL,
    market_cap_usd REAL,
    status TEXT NOT NULL DEFAULT 'incomplete',
    last_updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id INTEGER PRIMARY KEY AUTOINCREMENT,
    service TEXT NOT NULL,
    service_instance_id TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    start_slot INTEGER NOT NULL,
    start_block_time INTEGER,
    ended_at INTEGER,
    end_slot INTEGER,
    end_block_time INTEGER,
    end_reason TEXT,
    last_refresh_at INTEGER,
    last_refresh_slot INTEGER,
    last_refresh_block_time INTEGER,
    trades_count INTEGER NOT NULL DEFAULT 0,
    fees_usd REAL NOT NULL DEFAULT 0,
    buys_usd REAL NOT NULL DEFAULT 0,
    sells_usd REAL NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open_per_service
    ON sessions(service) WHERE ended_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_sessions_service_started_at ON sessions(service, started_at);

CREATE TABLE IF NOT EXISTS trades (
    txid TEXT PRIMARY KEY,
    wallet_id INTEGER NOT NULL,
    wallet_alias TEXT,
    coin_mint TEXT NOT NULL,
    trade_uuid TEXT NOT NULL,
    side TEXT NOT NULL,
    executed_at INTEGER NOT NULL,
    token_amount REAL NOT NULL DEFAULT 0,
    sol_amount REAL NOT NULL DEFAULT 0,
    price_sol_per_token REAL,
    price_usd_per_token REAL,
    sol_usd_price REAL,
    fees_sol REAL,
    fees_usd REAL,
    slippage_pct REAL,
    price_impact_pct REAL,
    program TEXT,
    strategy_id TEXT,
    strategy_name TEXT,
    decision_label TEXT,
    decision_reason TEXT,
    session_id INTEGER,
    evaluation_payload TEXT,
    decision_payload TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_wallet_mint ON trades(wallet_id, coin_mint);
CREATE INDEX IF NOT EXISTS idx_trades_trade_uuid ON trades(trade_uuid);
CREATE INDEX IF NOT EXISTS idx_trades_session ON trades(session_id);
CREATE INDEX IF NOT EXISTS idx_trades_executed_at ON trades(executed_at);

CREATE TABLE IF NOT EXISTS position_runs (
    position_id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_id INTEGER NOT NULL,
    coin_mint TEXT NOT NULL,
    trade_uuid TEXT NOT NULL,
    open_at INTEGER NOT NULL,
    closed_at INTEGER NOT NULL DEFAULT 0,
    last_trade_at INTEGER,
    last_updated_at INTEGER,
    entry_token_amount REAL NOT NULL DEFAULT 0,
    current_token_amount REAL NOT NULL DEFAULT 0,
    total_tokens_bought REAL NOT NULL DEFAULT 0,
    total_tokens_sold REAL NOT NULL DEFAULT 0,
    entry_price_sol REAL,
    entry_price_usd REAL,
    last_price_sol REAL,
    last_price_usd REAL,
    strategy_id TEXT,
    strategy_name TEXT,
    source TEXT
);

-- At most one open run per (wallet_id, coin_mint). `closed_at = 0` is the
-- sentinel for "open"; predicates elsewhere also accept NULL for rows
-- written by an older schema, but this crate itself never writes NULL.
CREATE UNIQUE INDEX IF NOT EXISTS idx_position_runs_open
    ON position_runs(wallet_id, coin_mint) WHERE closed_at = 0;
CREATE INDEX IF NOT EXISTS idx_position_runs_wallet_mint ON position_runs(wallet_id, coin_mint);
CREATE INDEX IF NOT EXISTS idx_position_runs_trade_uuid ON position_runs(trade_uuid);

CREATE TABLE IF NOT EXISTS pending_trade_uuids (
    wallet_id INTEGER NOT NULL,
    mint TEXT NOT NULL,
    trade_uuid TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (wallet_id, mint)
);

CREATE INDEX IF NOT EXISTS idx_pending_trade_uuids_created_at ON pending_trade_uuids(created_at);

CREATE TABLE IF NOT EXISTS pnl_rollup_per_mint (
    wallet_id INTEGER NOT NULL,
    coin_mint TEXT NOT NULL,
    total_tokens_bought REAL NOT NULL DEFAULT 0,
    total_tokens_sold REAL NOT NULL DEFAULT 0,
    total_sol_spent REAL NOT NULL DEFAULT 0,
    total_sol_received REAL NOT NULL DEFAULT 0,
    fees_sol REAL NOT NULL DEFAULT 0,
    fees_usd REAL NOT NULL DEFAULT 0,
    avg_cost_sol REAL NOT NULL DEFAULT 0,
    avg_cost_usd REAL NOT NULL DEFAULT 0,
    realized_sol REAL NOT NULL DEFAULT 0,
    realized_usd REAL NOT NULL DEFAULT 0,
    first_trade_at INTEGER,
    last_trade_at INTEGER,
    PRIMARY KEY (wallet_id, coin_mint)
);

CREATE TABLE IF NOT EXISTS pnl_rollup_per_run (
    wallet_id INTEGER NOT NULL,
    coin_mint TEXT NOT NULL,
    trade_uuid TEXT NOT NULL,
    total_tokens_bought REAL NOT NULL DEFAULT 0,
    total_tokens_sold REAL NOT NULL DEFAULT 0,
    total_sol_spent REAL NOT NULL DEFAULT 0,
    total_sol_received REAL NOT NULL DEFAULT 0,
    fees_sol REAL NOT NULL DEFAULT 0,
    fees_usd REAL NOT NULL DEFAULT 0,
    avg_cost_sol REAL NOT NULL DEFAULT 0,
    avg_cost_usd REAL NOT NULL DEFAULT 0,
    realized_sol REAL NOT NULL DEFAULT 0,
    realized_usd REAL NOT NULL DEFAULT 0,
    first_trade_at INTEGER,
    last_trade_at INTEGER,
    PRIMARY KEY (wallet_id, coin_mint, trade_uuid)
);

CREATE TABLE IF NOT EXISTS evaluations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ops_type TEXT NOT NULL,
    wallet_id INTEGER NOT NULL,
    wallet_alias TEXT,
    coin_mint TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    trade_uuid TEXT,
    symbol TEXT,
    strategy_name TEXT,
    strategy_source TEXT,
    recommendation TEXT,
    decision TEXT,
    regime TEXT,
    qualify_failed_count INTEGER,
    qualify_worst_severity TEXT,
    gate_fail INTEGER,
    price_usd REAL,
    liquidity_usd REAL,
    chart_interval TEXT,
    chart_points INTEGER,
    rsi REAL,
    macd_hist REAL,
    vwap REAL,
    warnings_count INTEGER,
    unreal_usd REAL,
    total_usd REAL,
    roi_pct REAL,
    reasons TEXT,
    payload TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_evaluations_trade_uuid_ts ON evaluations(trade_uuid, ts_ms);
CREATE INDEX IF NOT EXISTS idx_evaluations_mint_ts ON evaluations(coin_mint, ts_ms);
CREATE INDEX IF NOT EXISTS idx_evaluations_wallet_ts ON evaluations(wallet_id, ts_ms);

CREATE TABLE IF NOT EXISTS targets (
    mint TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'new',
    score REAL,
    confidence REAL,
    mint_verified INTEGER NOT NULL DEFAULT 0,
    vector_store_id TEXT,
    last_checked_at INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_targets_status_last_checked ON targets(status, last_checked_at);

CREATE TABLE IF NOT EXISTS schema_migrations (
    name TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- Per-mint rollup maintained from the trade ledger (component F). Fires only
-- on a fresh INSERT: the recorder's idempotent UPSERT routes duplicate
-- `txid`s through the ON CONFLICT DO UPDATE branch of `trades`, which this
-- trigger never sees, so replays cannot double-count.
CREATE TRIGGER IF NOT EXISTS trg_pnl_mint_buy
AFTER INSERT ON trades
WHEN NEW.side = 'buy'
BEGIN
    INSERT INTO pnl_rollup_per_mint (
        wallet_id, coin_mint, total_tokens_bought, total_sol_spent,
        fees_sol, fees_usd, avg_cost_sol, avg_cost_usd,
        first_trade_at, last_trade_at
    ) VALUES (
        NEW.wallet_id, NEW.coin_mint, NEW.token_amount, NEW.sol_amount,
        COALESCE(NEW.fees_sol, 0), COALESCE(NEW.fees_usd, 0),
        CASE WHEN NEW.token_amount != 0 THEN ABS(NEW.sol_amount) / NEW.token_amount ELSE 0 END,
        CASE WHEN NEW.token_amount != 0 THEN (ABS(NEW.sol_amount) * COALESCE(NEW.sol_usd_price, 0)) / NEW.token_amount ELSE 0 END,
        NEW.executed_at, NEW.executed_at
    )
    ON CONFLICT (wallet_id, coin_mint) DO UPDATE SET
        total_tokens_bought = total_tokens_bought + NEW.token_amount,
        total_sol_spent = total_sol_spent + NEW.sol_amount,
        fees_sol = fees_sol + COALESCE(NEW.fees_sol, 0),
        fees_usd = fees_usd + COALESCE(NEW.fees_usd, 0),
        avg_cost_sol = CASE WHEN (total_tokens_bought + NEW.token_amount) != 0
            THEN ABS(total_sol_spent + NEW.sol_amount) / (total_tokens_bought + NEW.token_amount)
            ELSE avg_cost_sol END,
        avg_cost_usd = CASE WHEN (total_tokens_bought + NEW.token_amount) != 0
            THEN (ABS(total_sol_spent + NEW.sol_amount) * COALESCE(NEW.sol_usd_price, 0)) / (total_tokens_bought + NEW.token_amount)
            ELSE avg_cost_usd END,
        first_trade_at = MIN(first_trade_at, NEW.executed_at),
        last_trade_at = MAX(last_trade_at, NEW.executed_at)
    WHERE wallet_id = NEW.wallet_id AND coin_mint = NEW.coin_mint;
END;

CREATE TRIGGER IF NOT EXISTS trg_pnl_run_buy
AFTER INSERT ON trades
WHEN NEW.side = 'buy'
BEGIN
    INSERT INTO pnl_rollup_per_run (
        wallet_id, coin_mint, trade_uuid, total_tokens_bought, total_sol_spent,
        fees_sol, fees_usd, avg_cost_sol, avg_cost_usd,
        first_trade_at, last_trade_at
    ) VALUES (
        NEW.wallet_id, NEW.coin_mint, NEW.trade_uuid, NEW.token_amount, NEW.sol_amount,
        COALESCE(NEW.fees_sol, 0), COALESCE(NEW.fees_usd, 0),
        CASE WHEN NEW.token_amount != 0 THEN ABS(NEW.sol_amount) / NEW.token_amount ELSE 0 END,
        CASE WHEN NEW.token_amount != 0 THEN (ABS(NEW.sol_amount) * COALESCE(NEW.sol_usd_price, 0)) / NEW.token_amount ELSE 0 END,
        NEW.executed_at, NEW.executed_at
    )
    ON CONFLICT (wallet_id, coin_mint, trade_uuid) DO UPDATE SET
        total_tokens_bought = total_tokens_bought + NEW.token_amount,
        total_sol_spent = total_sol_spent + NEW.sol_amount,
        fees_sol = fees_sol + COALESCE(NEW.fees_sol, 0),
        fees_usd = fees_usd + COALESCE(NEW.fees_usd, 0),
        avg_cost_sol = CASE WHEN (total_tokens_bought + NEW.token_amount) != 0
            THEN ABS(total_sol_spent + NEW.sol_amount) / (total_tokens_bought + NEW.token_amount)
            ELSE avg_cost_sol END,
        avg_cost_usd = CASE WHEN (total_tokens_bought + NEW.token_amount) != 0
            THEN (ABS(total_sol_spent + NEW.sol_amount) * COALESCE(NEW.sol_usd_price, 0)) / (total_tokens_bought + NEW.token_amount)
            ELSE avg_cost_usd END,
        first_trade_at = MIN(first_trade_at, NEW.executed_at),
        last_trade_at = MAX(last_trade_at, NEW.executed_at)
    WHERE wallet_id = NEW.wallet_id AND coin_mint = NEW.coin_mint AND trade_uuid = NEW.trade_uuid;
END;

-- Sells never change avg_cost; realized P&L is read against the avg cost as
-- it stood just before this row (the pre-update column value).
CREATE TRIGGER IF NOT EXISTS trg_pnl_mint_sell
AFTER INSERT ON trades
WHEN NEW.side = 'sell'
BEGIN
    INSERT INTO pnl_rollup_per_mint (
        wallet_id, coin_mint, total_tokens_sold, total_sol_received,
        fees_sol, fees_usd, realized_sol, realized_usd,
        first_trade_at, last_trade_at
    ) VALUES (
        NEW.wallet_id, NEW.coin_mint, NEW.token_amount, NEW.sol_amount,
        COALESCE(NEW.fees_sol, 0), COALESCE(NEW.fees_usd, 0),
        NEW.sol_amount, NEW.sol_amount * COALESCE(NEW.sol_usd_price, 0),
        NEW.executed_at, NEW.executed_at
    )
    ON CONFLICT (wallet_id, coin_mint) DO UPDATE SET
        total_tokens_sold = total_tokens_sold + NEW.token_amount,
        total_sol_received = total_sol_received + NEW.sol_amount,
        fees_sol = fees_sol + COALESCE(NEW.fees_sol, 0),
        fees_usd = fees_usd + COALESCE(NEW.fees_usd, 0),
        realized_sol = realized_sol + (NEW.sol_amount - NEW.token_amount * avg_cost_sol),
        realized_usd = realized_usd + ((NEW.sol_amount - NEW.token_amount * avg_cost_sol) * COALESCE(NEW.sol_usd_price, 0)),
        first_trade_at = MIN(first_trade_at, NEW.executed_at),
        last_trade_at = MAX(last_trade_at, NEW.executed_at)
    WHERE wallet_id = NEW.wallet_id AND coin_mint = NEW.coin_mint;
END;

CREATE TRIGGER IF NOT EXISTS trg_pnl_run_sell
AFTER INSERT ON trades
WHEN NEW.side = 'sell'
BEGIN
    INSERT INTO pnl_rollup_per_run (
        wallet_id, coin_mint, trade_uuid, total_tokens_sold, total_sol_received,
        fees_sol, fees_usd, realized_sol, realized_usd,
        first_trade_at, last_trade_at
    ) VALUES (
        NEW.wallet_id, NEW.coin_mint, NEW.trade_uuid, NEW.token_amount, NEW.sol_amount,
        COALESCE(NEW.fees_sol, 0), COALESCE(NEW.fees_usd, 0),
        NEW.sol_amount, NEW.sol_amount * COALESCE(NEW.sol_usd_price, 0),
        NEW.executed_at, NEW.executed_at
    )
    ON CONFLICT (wallet_id, coin_mint, trade_uuid) DO UPDATE SET
        total_tokens_sold = total_tokens_sold + NEW.token_amount,
        total_sol_received = total_sol_received + NEW.sol_amount,
        fees_sol = fees_sol + COALESCE(NEW.fees_sol, 0),
        fees_usd = fees_usd + COALESCE(NEW.fees_usd, 0),
        realized_sol = realized_sol + (NEW.sol_amount - NEW.token_amount * avg_cost_sol),
        realized_usd = realized_usd + ((NEW.sol_amount - NEW.token_amount * avg_cost_sol) * COALESCE(NEW.sol_usd_price, 0)),
        first_trade_at = MIN(first_trade_at, NEW.executed_at),
        last_trade_at = MAX(last_trade_at, NEW.executed_at)
    WHERE wallet_id = NEW.wallet_id AND coin_mint = NEW.coin_mint AND trade_uuid = NEW.trade_uuid;
END;
"#;

/// Create every table, index and trigger this crate needs, idempotently.
pub async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> Pool<Sqlite> {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let pool = memory_pool().await;
        ensure_schema(&pool).await.unwrap();
        ensure_schema(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn creates_expected_tables() {
        let pool = memory_pool().await;
        ensure_schema(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        for expected in [
            "wallets",
            "coins",
            "sessions",
            "trades",
            "position_runs",
            "pending_trade_uuids",
            "pnl_rollup_per_mint",
            "pnl_rollup_per_run",
            "evaluations",
            "targets",
            "schema_migrations",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
        }
    }

    #[tokio::test]
    async fn open_position_index_rejects_second_open_run() {
        let pool = memory_pool().await;
        ensure_schema(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO position_runs (wallet_id, coin_mint, trade_uuid, open_at, closed_at)
             VALUES (1, 'MINT', 'u1', 1000, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let second = sqlx::query(
            "INSERT INTO position_runs (wallet_id, coin_mint, trade_uuid, open_at, closed_at)
             VALUES (1, 'MINT', 'u2', 2000, 0)",
        )
        .execute(&pool)
        .await;

        assert!(second.is_err(), "second open run for the same pair must be rejected");
    }

    #[tokio::test]
    async fn pnl_rollup_trigger_computes_avg_cost_on_buy() {
        let pool = memory_pool().await;
        ensure_schema(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO trades (txid, wallet_id, coin_mint, trade_uuid, side, executed_at,
             token_amount, sol_amount, sol_usd_price, created_at, updated_at)
             VALUES ('T1', 1, 'M1', 'U1', 'buy', 1000, 100, 1, 150, 1000, 1000)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let row: (f64, f64) = sqlx::query_as(
            "SELECT avg_cost_sol, avg_cost_usd FROM pnl_rollup_per_mint WHERE wallet_id = 1 AND coin_mint = 'M1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert!((row.0 - 0.01).abs() < 1e-9);
        assert!((row.1 - 1.5).abs() < 1e-9);
    }
}
