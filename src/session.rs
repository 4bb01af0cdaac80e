//! Service-level session manager (component G).
//!
//! One open session per `service` label, enforced by a partial-unique index
//! (`db::schema`). `start` absorbs crash recovery the same way a crash-recovery
//! `TransactionMonitor` treats a stale in-flight transaction: close it out
//! with a terminal status before starting the new one, all in one transaction.

use crate::db::Db;
use crate::error::{Result, ScoundrelError};
use sqlx::{FromRow, Row};
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub session_id: i64,
    pub service: String,
    pub service_instance_id: String,
    pub started_at: i64,
    pub start_slot: i64,
    pub start_block_time: Option<i64>,
    pub ended_at: Option<i64>,
    pub end_slot: Option<i64>,
    pub end_block_time: Option<i64>,
    pub end_reason: Option<String>,
    pub last_refresh_at: Option<i64>,
    pub last_refresh_slot: Option<i64>,
    pub last_refresh_block_time: Option<i64>,
    pub trades_count: i64,
    pub fees_usd: f64,
    pub buys_usd: f64,
    pub sells_usd: f64,
}

pub struct StartParams {
    pub service: String,
    pub service_instance_id: String,
    pub start_slot: i64,
    pub start_block_time: Option<i64>,
    pub started_at: i64,
}

/// Close any stale open session for `service` as a crash, then open a new
/// one, in a single transaction. Returns the new session's id.
#[instrument(skip(db, params), fields(service = %params.service))]
pub async fn start(db: &Db, params: StartParams) -> Result<i64> {
    if params.start_slot <= 0 {
        return Err(ScoundrelError::validation("start_slot must be a positive integer"));
    }

    let mut tx = db.pool().begin().await?;

    let stale = sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE service = ? AND ended_at IS NULL",
    )
    .bind(&params.service)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(stale) = stale {
        warn!(session_id = stale.session_id, "closing stale open session as crash");
        let end_slot = stale.last_refresh_slot.unwrap_or(stale.start_slot);
        let end_block_time = stale.last_refresh_block_time.or(stale.start_block_time);
        sqlx::query(
            "UPDATE sessions SET ended_at = ?, end_slot = ?, end_block_time = ?, end_reason = 'crash'
             WHERE session_id = ?",
        )
        .bind(params.started_at)
        .bind(end_slot)
        .bind(end_block_time)
        .bind(stale.session_id)
        .execute(&mut *tx)
        .await?;
    }

    let result = sqlx::query(
        "INSERT INTO sessions (
            service, service_instance_id, started_at, start_slot, start_block_time,
            last_refresh_at, last_refresh_slot, last_refresh_block_time
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&params.service)
    .bind(&params.service_instance_id)
    .bind(params.started_at)
    .bind(params.start_slot)
    .bind(params.start_block_time)
    .bind(params.started_at)
    .bind(params.start_slot)
    .bind(params.start_block_time)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    let session_id = result.last_insert_rowid();
    info!(session_id, "session started");
    Ok(session_id)
}

#[derive(Default)]
struct Rollup {
    trades_count: i64,
    fees_usd: f64,
    buys_usd: f64,
    sells_usd: f64,
}

async fn compute_rollup(tx: &mut sqlx::SqliteConnection, session_id: i64) -> Result<Rollup> {
    let row = sqlx::query(
        "SELECT
            COUNT(*) as trades_count,
            COALESCE(SUM(fees_usd), 0) as fees_usd,
            COALESCE(SUM(CASE WHEN side = 'buy' THEN ABS(sol_amount) * COALESCE(sol_usd_price, 0) ELSE 0 END), 0) as buys_usd,
            COALESCE(SUM(CASE WHEN side = 'sell' THEN ABS(sol_amount) * COALESCE(sol_usd_price, 0) ELSE 0 END), 0) as sells_usd
         FROM trades WHERE session_id = ?",
    )
    .bind(session_id)
    .fetch_one(&mut *tx)
    .await?;

    Ok(Rollup {
        trades_count: row.get("trades_count"),
        fees_usd: row.get("fees_usd"),
        buys_usd: row.get("buys_usd"),
        sells_usd: row.get("sells_usd"),
    })
}

pub struct RefreshParams {
    pub session_id: i64,
    pub current_slot: i64,
    pub current_block_time: Option<i64>,
    pub now: i64,
}

/// Recompute rollups from the ledger and update the heartbeat fields.
#[instrument(skip(db, params), fields(session_id = params.session_id))]
pub async fn refresh(db: &Db, params: RefreshParams) -> Result<()> {
    let mut tx = db.pool().begin().await?;
    let rollup = compute_rollup(&mut tx, params.session_id).await?;

    sqlx::query(
        "UPDATE sessions SET
            last_refresh_at = ?, last_refresh_slot = ?, last_refresh_block_time = ?,
            trades_count = ?, fees_usd = ?, buys_usd = ?, sells_usd = ?
         WHERE session_id = ?",
    )
    .bind(params.now)
    .bind(params.current_slot)
    .bind(params.current_block_time)
    .bind(rollup.trades_count)
    .bind(rollup.fees_usd)
    .bind(rollup.buys_usd)
    .bind(rollup.sells_usd)
    .bind(params.session_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub struct EndParams {
    pub session_id: i64,
    pub end_slot: Option<i64>,
    pub end_block_time: Option<i64>,
    pub reason: String,
    pub now: i64,
}

/// Recompute rollups (as `refresh` does) and stamp the session closed.
#[instrument(skip(db, params), fields(session_id = params.session_id))]
pub async fn end(db: &Db, params: EndParams) -> Result<()> {
    let mut tx = db.pool().begin().await?;
    let rollup = compute_rollup(&mut tx, params.session_id).await?;

    sqlx::query(
        "UPDATE sessions SET
            ended_at = ?, end_slot = ?, end_block_time = ?, end_reason = ?,
            last_refresh_at = ?, last_refresh_slot = COALESCE(?, last_refresh_slot),
            last_refresh_block_time = COALESCE(?, last_refresh_block_time),
            trades_count = ?, fees_usd = ?, buys_usd = ?, sells_usd = ?
         WHERE session_id = ?",
    )
    .bind(params.now)
    .bind(params.end_slot)
    .bind(params.end_block_time)
    .bind(&params.reason)
    .bind(params.now)
    .bind(params.end_slot)
    .bind(params.end_block_time)
    .bind(rollup.trades_count)
    .bind(rollup.fees_usd)
    .bind(rollup.buys_usd)
    .bind(rollup.sells_usd)
    .bind(params.session_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn get_active(db: &Db, service: &str) -> Result<Option<Session>> {
    let row = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE service = ? AND ended_at IS NULL")
        .bind(service)
        .fetch_optional(db.pool())
        .await?;
    Ok(row)
}

pub async fn get_active_id(db: &Db, service: &str) -> Result<Option<i64>> {
    Ok(get_active(db, service).await?.map(|s| s.session_id))
}

/// The most recent session where `startedAt <= T <= (endedAt ?? +inf)`.
/// `timestamp` is accepted in seconds or ms (values below `1e11` are
/// seconds).
pub async fn get_past_session_id(db: &Db, service: &str, timestamp: i64) -> Result<Option<i64>> {
    let t = crate::types::normalize_to_ms(timestamp);
    let row = sqlx::query(
        "SELECT session_id FROM sessions
         WHERE service = ? AND started_at <= ? AND (ended_at IS NULL OR ended_at >= ?)
         ORDER BY started_at DESC LIMIT 1",
    )
    .bind(service)
    .bind(t)
    .bind(t)
    .fetch_optional(db.pool())
    .await?;
    Ok(row.map(|r| r.get("session_id")))
}
