//! Trade recorder (component E).
//!
//! Single-writer, idempotent entry point for every trade event. One
//! `pool.begin()` transaction per write, `COALESCE` merge on conflict, and
//! an explicit schema-drift repair path instead of letting a missing
//! constraint surface as a raw driver error.

use crate::db::Db;
use crate::error::{Result, ScoundrelError};
use crate::position::{self, ApplyTradeInput, PositionRun};
use crate::resolver::Resolver;
use crate::types::{normalize_to_ms, Mint, Side, WalletId};
use sqlx::{FromRow, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

const PAST_TRADE_BACKFILL_LABEL: &str = "past_trade_backfill";

#[derive(Debug, Clone, FromRow)]
pub struct TradeEvent {
    pub txid: String,
    pub wallet_id: WalletId,
    pub wallet_alias: Option<String>,
    pub coin_mint: Mint,
    pub trade_uuid: String,
    pub side: String,
    pub executed_at: i64,
    pub token_amount: f64,
    pub sol_amount: f64,
    pub price_sol_per_token: Option<f64>,
    pub price_usd_per_token: Option<f64>,
    pub sol_usd_price: Option<f64>,
    pub fees_sol: Option<f64>,
    pub fees_usd: Option<f64>,
    pub slippage_pct: Option<f64>,
    pub price_impact_pct: Option<f64>,
    pub program: Option<String>,
    pub strategy_id: Option<String>,
    pub strategy_name: Option<String>,
    pub decision_label: Option<String>,
    pub decision_reason: Option<String>,
    pub session_id: Option<i64>,
    pub evaluation_payload: Option<String>,
    pub decision_payload: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Caller-supplied facts about a trade. Anything left `None` is preserved
/// from a prior row with the same `txid` on replay.
#[derive(Debug, Clone, Default)]
pub struct RecordTradeInput {
    pub wallet_id: WalletId,
    pub wallet_alias: Option<String>,
    pub coin_mint: Mint,
    pub side: Side,
    pub txid: String,
    pub executed_at: i64,
    pub token_amount: f64,
    pub sol_amount: f64,
    pub price_sol_per_token: Option<f64>,
    pub price_usd_per_token: Option<f64>,
    pub sol_usd_price: Option<f64>,
    pub fees_sol: Option<f64>,
    pub fees_usd: Option<f64>,
    pub slippage_pct: Option<f64>,
    pub price_impact_pct: Option<f64>,
    pub program: Option<String>,
    pub strategy_id: Option<String>,
    pub strategy_name: Option<String>,
    pub decision_label: Option<String>,
    pub decision_reason: Option<String>,
    /// The service this trade belongs to, used to resolve `session_id` when
    /// the caller doesn't supply one. Defaults to `"default"`.
    pub service: Option<String>,
    pub session_id: Option<i64>,
    pub trade_uuid: Option<String>,
    pub evaluation_payload: Option<String>,
    pub decision_payload: Option<String>,
}

impl Default for Side {
    fn default() -> Self {
        Side::Buy
    }
}

fn is_missing_unique_constraint(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.message().contains("ON CONFLICT clause does not match"))
}

async fn resolve_open_session_id(db: &Db, service: &str) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT session_id FROM sessions WHERE service = ? AND ended_at IS NULL")
        .bind(service)
        .fetch_optional(db.pool())
        .await?;
    Ok(row.map(|r| r.get("session_id")))
}

/// Record a live trade event: validates, resolves its position-run uuid,
/// upserts the ledger row, and applies it to the position state machine.
#[instrument(skip(db, resolver, input), fields(txid = %input.txid))]
pub async fn record(db: &Db, resolver: &Resolver, input: RecordTradeInput) -> Result<TradeEvent> {
    validate(&input)?;
    let executed_at = normalize_to_ms(input.executed_at);

    let trade_uuid = resolve_trade_uuid(resolver, &input).await?;
    let service = input.service.as_deref().unwrap_or("default");
    let session_id = match input.session_id {
        Some(id) => Some(id),
        None => resolve_open_session_id(db, service).await?,
    };

    let (event, is_new) = upsert_trade(db, &input, executed_at, &trade_uuid, session_id).await?;

    if is_new {
        let application = ApplyTradeInput {
            wallet_id: input.wallet_id,
            coin_mint: input.coin_mint.clone(),
            trade_uuid: trade_uuid.clone(),
            side: input.side,
            executed_at,
            token_amount: input.token_amount,
            sol_amount: input.sol_amount,
            price_sol_per_token: input.price_sol_per_token,
            price_usd_per_token: input.price_usd_per_token,
            strategy_id: input.strategy_id.clone(),
            strategy_name: input.strategy_name.clone(),
            source: None,
        };

        match position::apply_trade(db, &application).await {
            Ok(run) if !run.is_open() => {
                // Run closed: drop the cached/pending uuid so the next trade for
                // this pair (a fresh buy) doesn't get handed the uuid of the
                // run that just ended.
                if let Err(e) = resolver.clear(input.wallet_id, &input.coin_mint).await {
                    warn!(error = %e, "failed to clear resolver state after run close");
                }
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "applier failed, trade row retained for rebuild"),
        }
    } else {
        debug!(txid = %event.txid, "duplicate txid replay, position-run state left unchanged");
    }

    Ok(event)
}

/// Historical backfill: persists the ledger row with the same merge
/// semantics as `record`, but never touches position-run state or mints a
/// fresh uuid.
#[instrument(skip(db, input), fields(txid = %input.txid))]
pub async fn record_past(db: &Db, mut input: RecordTradeInput, note: &str) -> Result<TradeEvent> {
    validate(&input)?;
    let executed_at = normalize_to_ms(input.executed_at);

    input.decision_label = Some(PAST_TRADE_BACKFILL_LABEL.to_string());
    input.decision_reason = Some(note.to_string());

    let trade_uuid = input
        .trade_uuid
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let session_id = match input.session_id {
        Some(id) => Some(id),
        None => resolve_session_active_at(db, input.service.as_deref().unwrap_or("default"), executed_at).await?,
    };

    let (event, _is_new) = upsert_trade(db, &input, executed_at, &trade_uuid, session_id).await?;
    Ok(event)
}

async fn resolve_session_active_at(db: &Db, service: &str, at: i64) -> Result<Option<i64>> {
    let row = sqlx::query(
        "SELECT session_id FROM sessions
         WHERE service = ? AND started_at <= ? AND (ended_at IS NULL OR ended_at >= ?)
         ORDER BY started_at DESC LIMIT 1",
    )
    .bind(service)
    .bind(at)
    .bind(at)
    .fetch_optional(db.pool())
    .await?;
    Ok(row.map(|r| r.get("session_id")))
}

fn validate(input: &RecordTradeInput) -> Result<()> {
    if input.wallet_id <= 0 {
        return Err(ScoundrelError::validation("wallet_id must be positive"));
    }
    if input.coin_mint.trim().is_empty() {
        return Err(ScoundrelError::validation("coin_mint is required"));
    }
    if input.txid.trim().is_empty() {
        return Err(ScoundrelError::validation("txid is required"));
    }
    Ok(())
}

async fn resolve_trade_uuid(resolver: &Resolver, input: &RecordTradeInput) -> Result<String> {
    if let Some(uuid) = &input.trade_uuid {
        resolver.bind(input.wallet_id, &input.coin_mint, uuid).await?;
        return Ok(uuid.clone());
    }

    if let Some(uuid) = resolver.resolve(input.wallet_id, &input.coin_mint).await? {
        return Ok(uuid);
    }

    let uuid = Uuid::new_v4().to_string();
    if input.side == Side::Sell {
        warn!("sell with no resolvable run uuid, minting a fresh one");
    }
    resolver.bind(input.wallet_id, &input.coin_mint, &uuid).await?;
    Ok(uuid)
}

async fn upsert_trade(
    db: &Db,
    input: &RecordTradeInput,
    executed_at: i64,
    trade_uuid: &str,
    session_id: Option<i64>,
) -> Result<(TradeEvent, bool)> {
    match upsert_trade_once(db, input, executed_at, trade_uuid, session_id).await {
        Ok(event) => Ok(event),
        Err(ScoundrelError::Storage(e)) if is_missing_unique_constraint(&e) => {
            warn!("trades.txid missing unique constraint, repairing schema and retrying once");
            sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_txid_unique ON trades(txid)")
                .execute(db.pool())
                .await
                .map_err(|e| ScoundrelError::StorageSchemaDrift(e.to_string()))?;
            upsert_trade_once(db, input, executed_at, trade_uuid, session_id).await
        }
        Err(e) => Err(e),
    }
}

/// Upserts the ledger row, returning whether this txid was seen for the
/// first time. The position-run applier only runs for fresh inserts: the
/// `ON CONFLICT DO UPDATE` path already leaves the PnL rollup triggers
/// un-fired, and re-applying a replayed trade to the position-run state
/// machine would double-count it there too.
async fn upsert_trade_once(
    db: &Db,
    input: &RecordTradeInput,
    executed_at: i64,
    trade_uuid: &str,
    session_id: Option<i64>,
) -> Result<(TradeEvent, bool)> {
    let mut tx = db.pool().begin().await?;
    let now = crate::db::now_ms();

    let already_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM trades WHERE txid = ?")
        .bind(&input.txid)
        .fetch_optional(&mut *tx)
        .await?;
    let is_new = already_exists.is_none();

    sqlx::query(
        "INSERT INTO trades (
            txid, wallet_id, wallet_alias, coin_mint, trade_uuid, side, executed_at,
            token_amount, sol_amount, price_sol_per_token, price_usd_per_token, sol_usd_price,
            fees_sol, fees_usd, slippage_pct, price_impact_pct, program, strategy_id,
            strategy_name, decision_label, decision_reason, session_id, evaluation_payload,
            decision_payload, created_at, updated_at
        ) VALUES (
            ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
        )
        ON CONFLICT(txid) DO UPDATE SET
            wallet_alias = COALESCE(excluded.wallet_alias, wallet_alias),
            trade_uuid = COALESCE(excluded.trade_uuid, trade_uuid),
            executed_at = MAX(excluded.executed_at, executed_at),
            token_amount = COALESCE(excluded.token_amount, token_amount),
            sol_amount = COALESCE(excluded.sol_amount, sol_amount),
            price_sol_per_token = COALESCE(excluded.price_sol_per_token, price_sol_per_token),
            price_usd_per_token = COALESCE(excluded.price_usd_per_token, price_usd_per_token),
            sol_usd_price = COALESCE(excluded.sol_usd_price, sol_usd_price),
            fees_sol = COALESCE(excluded.fees_sol, fees_sol),
            fees_usd = COALESCE(excluded.fees_usd, fees_usd),
            slippage_pct = COALESCE(excluded.slippage_pct, slippage_pct),
            price_impact_pct = COALESCE(excluded.price_impact_pct, price_impact_pct),
            program = COALESCE(excluded.program, program),
            strategy_id = COALESCE(excluded.strategy_id, strategy_id),
            strategy_name = COALESCE(excluded.strategy_name, strategy_name),
            decision_label = COALESCE(excluded.decision_label, decision_label),
            decision_reason = COALESCE(excluded.decision_reason, decision_reason),
            session_id = COALESCE(excluded.session_id, session_id),
            evaluation_payload = COALESCE(excluded.evaluation_payload, evaluation_payload),
            decision_payload = COALESCE(excluded.decision_payload, decision_payload),
            updated_at = excluded.updated_at",
    )
    .bind(&input.txid)
    .bind(input.wallet_id)
    .bind(&input.wallet_alias)
    .bind(&input.coin_mint)
    .bind(trade_uuid)
    .bind(input.side.as_str())
    .bind(executed_at)
    .bind(input.token_amount)
    .bind(input.sol_amount)
    .bind(input.price_sol_per_token)
    .bind(input.price_usd_per_token)
    .bind(input.sol_usd_price)
    .bind(input.fees_sol)
    .bind(input.fees_usd)
    .bind(input.slippage_pct)
    .bind(input.price_impact_pct)
    .bind(&input.program)
    .bind(&input.strategy_id)
    .bind(&input.strategy_name)
    .bind(&input.decision_label)
    .bind(&input.decision_reason)
    .bind(session_id)
    .bind(&input.evaluation_payload)
    .bind(&input.decision_payload)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let event = sqlx::query_as::<_, TradeEvent>("SELECT * FROM trades WHERE txid = ?")
        .bind(&input.txid)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok((event, is_new))
}

/// Look up the position run created for a trade, for callers (tests, the
/// swap worker) that want to confirm the applier ran.
pub async fn position_for(db: &Db, wallet_id: WalletId, mint: &str) -> Result<Option<PositionRun>> {
    let row = sqlx::query_as::<_, PositionRun>(
        "SELECT * FROM position_runs WHERE wallet_id = ? AND coin_mint = ? ORDER BY open_at DESC LIMIT 1",
    )
    .bind(wallet_id)
    .bind(mint)
    .fetch_optional(db.pool())
    .await?;
    Ok(row)
}
