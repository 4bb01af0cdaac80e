//! Position-run state machine (component D).
//!
//! Tracks the open/closed lifecycle of a wallet/mint campaign the way
//! `tradai-platform`'s `Position` tracks an exchange position: a row per
//! campaign, opened on first entry, updated on every fill, closed when
//! holdings return to (approximately) zero.

use crate::db::Db;
use crate::error::{Result, ScoundrelError};
use crate::types::{Mint, Side, WalletId};
use sqlx::{FromRow, Row};
use tracing::{instrument, warn};

/// Holdings below this are treated as fully closed, guarding against
/// floating-point dust left by repeated partial sells.
pub const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, FromRow)]
pub struct PositionRun {
    pub position_id: i64,
    pub wallet_id: WalletId,
    pub coin_mint: Mint,
    pub trade_uuid: String,
    pub open_at: i64,
    pub closed_at: i64,
    pub last_trade_at: Option<i64>,
    pub last_updated_at: Option<i64>,
    pub entry_token_amount: f64,
    pub current_token_amount: f64,
    pub total_tokens_bought: f64,
    pub total_tokens_sold: f64,
    pub entry_price_sol: Option<f64>,
    pub entry_price_usd: Option<f64>,
    pub last_price_sol: Option<f64>,
    pub last_price_usd: Option<f64>,
    pub strategy_id: Option<String>,
    pub strategy_name: Option<String>,
    pub source: Option<String>,
}

impl PositionRun {
    pub fn is_open(&self) -> bool {
        self.closed_at == 0
    }
}

/// The subset of a trade event the applier needs, already validated and
/// uuid-resolved by the recorder (E).
#[derive(Debug, Clone)]
pub struct ApplyTradeInput {
    pub wallet_id: WalletId,
    pub coin_mint: Mint,
    pub trade_uuid: String,
    pub side: Side,
    pub executed_at: i64,
    pub token_amount: f64,
    pub sol_amount: f64,
    pub price_sol_per_token: Option<f64>,
    pub price_usd_per_token: Option<f64>,
    pub strategy_id: Option<String>,
    pub strategy_name: Option<String>,
    pub source: Option<String>,
}

async fn fetch_open(db: &Db, wallet_id: WalletId, mint: &str) -> Result<Option<PositionRun>> {
    let row = sqlx::query_as::<_, PositionRun>(
        "SELECT * FROM position_runs
         WHERE wallet_id = ? AND coin_mint = ? AND (closed_at = 0 OR closed_at IS NULL)
         ORDER BY open_at DESC LIMIT 1",
    )
    .bind(wallet_id)
    .bind(mint)
    .fetch_optional(db.pool())
    .await?;
    Ok(row)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}

/// Apply one trade to the position-run state machine, per spec.md §4.3.
/// Retries once on a unique-index race against a concurrent opener.
#[instrument(skip(db, trade), fields(wallet_id = trade.wallet_id, mint = %trade.coin_mint))]
pub async fn apply_trade(db: &Db, trade: &ApplyTradeInput) -> Result<PositionRun> {
    match apply_trade_once(db, trade).await {
        Ok(run) => Ok(run),
        Err(ScoundrelError::Storage(e)) if is_unique_violation(&e) => {
            warn!("position_runs race detected, retrying once");
            apply_trade_once(db, trade).await
        }
        Err(e) => Err(e),
    }
}

async fn apply_trade_once(db: &Db, trade: &ApplyTradeInput) -> Result<PositionRun> {
    let mut tx = db.pool().begin().await?;

    let open = sqlx::query_as::<_, PositionRun>(
        "SELECT * FROM position_runs
         WHERE wallet_id = ? AND coin_mint = ? AND (closed_at = 0 OR closed_at IS NULL)
         ORDER BY open_at DESC LIMIT 1",
    )
    .bind(trade.wallet_id)
    .bind(&trade.coin_mint)
    .fetch_optional(&mut *tx)
    .await?;

    let position_id = match open {
        None => match trade.side {
            Side::Buy => {
                let result = sqlx::query(
                    "INSERT INTO position_runs (
                        wallet_id, coin_mint, trade_uuid, open_at, closed_at,
                        last_trade_at, last_updated_at, entry_token_amount, current_token_amount,
                        total_tokens_bought, total_tokens_sold, entry_price_sol, entry_price_usd,
                        last_price_sol, last_price_usd, strategy_id, strategy_name, source
                    ) VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(trade.wallet_id)
                .bind(&trade.coin_mint)
                .bind(&trade.trade_uuid)
                .bind(trade.executed_at)
                .bind(trade.executed_at)
                .bind(trade.executed_at)
                .bind(trade.token_amount)
                .bind(trade.token_amount)
                .bind(trade.token_amount)
                .bind(trade.price_sol_per_token)
                .bind(trade.price_usd_per_token)
                .bind(trade.price_sol_per_token)
                .bind(trade.price_usd_per_token)
                .bind(&trade.strategy_id)
                .bind(&trade.strategy_name)
                .bind(&trade.source)
                .execute(&mut *tx)
                .await?;
                result.last_insert_rowid()
            }
            Side::Sell => {
                warn!("sell with no open position run, creating orphan closed run");
                let result = sqlx::query(
                    "INSERT INTO position_runs (
                        wallet_id, coin_mint, trade_uuid, open_at, closed_at,
                        last_trade_at, last_updated_at, entry_token_amount, current_token_amount,
                        total_tokens_bought, total_tokens_sold, last_price_sol, last_price_usd,
                        strategy_id, strategy_name, source
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, 0, ?, ?, ?, ?, ?, ?)",
                )
                .bind(trade.wallet_id)
                .bind(&trade.coin_mint)
                .bind(&trade.trade_uuid)
                .bind(trade.executed_at)
                .bind(trade.executed_at)
                .bind(trade.executed_at)
                .bind(trade.executed_at)
                .bind(trade.token_amount)
                .bind(trade.price_sol_per_token)
                .bind(trade.price_usd_per_token)
                .bind(&trade.strategy_id)
                .bind(&trade.strategy_name)
                .bind(&trade.source)
                .execute(&mut *tx)
                .await?;
                result.last_insert_rowid()
            }
        },
        Some(existing) => {
            match trade.side {
                Side::Buy => {
                    sqlx::query(
                        "UPDATE position_runs SET
                            current_token_amount = current_token_amount + ?,
                            total_tokens_bought = total_tokens_bought + ?,
                            last_trade_at = ?,
                            last_updated_at = ?,
                            last_price_sol = COALESCE(?, last_price_sol),
                            last_price_usd = COALESCE(?, last_price_usd)
                         WHERE position_id = ?",
                    )
                    .bind(trade.token_amount)
                    .bind(trade.token_amount)
                    .bind(trade.executed_at)
                    .bind(trade.executed_at)
                    .bind(trade.price_sol_per_token)
                    .bind(trade.price_usd_per_token)
                    .bind(existing.position_id)
                    .execute(&mut *tx)
                    .await?;
                }
                Side::Sell => {
                    let remaining = existing.current_token_amount - trade.token_amount;
                    let (clamped, closed_at) = if remaining <= EPSILON {
                        (0.0, trade.executed_at)
                    } else {
                        (remaining, 0)
                    };

                    sqlx::query(
                        "UPDATE position_runs SET
                            current_token_amount = ?,
                            total_tokens_sold = total_tokens_sold + ?,
                            last_trade_at = ?,
                            last_updated_at = ?,
                            last_price_sol = COALESCE(?, last_price_sol),
                            last_price_usd = COALESCE(?, last_price_usd),
                            closed_at = CASE WHEN ? != 0 THEN ? ELSE closed_at END
                         WHERE position_id = ?",
                    )
                    .bind(clamped)
                    .bind(trade.token_amount)
                    .bind(trade.executed_at)
                    .bind(trade.executed_at)
                    .bind(trade.price_sol_per_token)
                    .bind(trade.price_usd_per_token)
                    .bind(closed_at)
                    .bind(closed_at)
                    .bind(existing.position_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            existing.position_id
        }
    };

    let row = sqlx::query_as::<_, PositionRun>("SELECT * FROM position_runs WHERE position_id = ?")
        .bind(position_id)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(row)
}

/// Count of open runs for a pair; used by tests and by callers verifying the
/// at-most-one-open invariant directly.
pub async fn count_open(db: &Db, wallet_id: WalletId, mint: &str) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) as c FROM position_runs WHERE wallet_id = ? AND coin_mint = ? AND (closed_at = 0 OR closed_at IS NULL)")
        .bind(wallet_id)
        .bind(mint)
        .fetch_one(db.pool())
        .await?;
    Ok(row.get("c"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        Db::connect("sqlite::memory:").await.unwrap()
    }

    fn buy(uuid: &str, at: i64, tokens: f64, sol: f64) -> ApplyTradeInput {
        ApplyTradeInput {
            wallet_id: 1,
            coin_mint: "M1".into(),
            trade_uuid: uuid.into(),
            side: Side::Buy,
            executed_at: at,
            token_amount: tokens,
            sol_amount: sol,
            price_sol_per_token: Some(sol / tokens),
            price_usd_per_token: None,
            strategy_id: None,
            strategy_name: None,
            source: None,
        }
    }

    fn sell(uuid: &str, at: i64, tokens: f64, sol: f64) -> ApplyTradeInput {
        let mut t = buy(uuid, at, tokens, sol);
        t.side = Side::Sell;
        t
    }

    #[tokio::test]
    async fn fresh_buy_opens_a_run() {
        let db = test_db().await;
        let run = apply_trade(&db, &buy("U1", 1000, 100.0, 1.0)).await.unwrap();
        assert!(run.is_open());
        assert_eq!(run.current_token_amount, 100.0);
        assert_eq!(run.total_tokens_bought, 100.0);
        assert_eq!(run.trade_uuid, "U1");
    }

    #[tokio::test]
    async fn full_dump_closes_the_run() {
        let db = test_db().await;
        apply_trade(&db, &buy("U1", 1000, 100.0, 1.0)).await.unwrap();
        let run = apply_trade(&db, &sell("U1", 2000, 100.0, 1.6)).await.unwrap();
        assert!(!run.is_open());
        assert_eq!(run.closed_at, 2000);
        assert_eq!(run.current_token_amount, 0.0);
        assert_eq!(run.total_tokens_sold, 100.0);
    }

    #[tokio::test]
    async fn dust_remainder_clamps_to_zero_and_closes() {
        let db = test_db().await;
        apply_trade(&db, &buy("U1", 1000, 100.0, 1.0)).await.unwrap();
        apply_trade(&db, &sell("U1", 2000, 99.9999999995, 1.5)).await.unwrap();
        let run = apply_trade(&db, &sell("U1", 3000, 1e-10, 0.0)).await.unwrap();
        assert!(!run.is_open());
        assert_eq!(run.current_token_amount, 0.0);
    }

    #[tokio::test]
    async fn sell_with_no_open_run_creates_orphan_closed_run() {
        let db = test_db().await;
        let run = apply_trade(&db, &sell("U3", 5000, 50.0, 0.5)).await.unwrap();
        assert!(!run.is_open());
        assert_eq!(run.closed_at, 5000);
        assert_eq!(run.total_tokens_sold, 50.0);
    }

    #[tokio::test]
    async fn at_most_one_open_run_per_pair() {
        let db = test_db().await;
        apply_trade(&db, &buy("U1", 1000, 50.0, 0.5)).await.unwrap();
        apply_trade(&db, &buy("U1", 2000, 50.0, 0.5)).await.unwrap();
        let open_count = count_open(&db, 1, "M1").await.unwrap();
        assert_eq!(open_count, 1);
    }

    #[tokio::test]
    async fn entry_price_is_first_wins_on_repeated_buys() {
        let db = test_db().await;
        apply_trade(&db, &buy("U1", 1000, 50.0, 0.5)).await.unwrap();
        let run = apply_trade(&db, &buy("U1", 2000, 50.0, 5.0)).await.unwrap();
        assert_eq!(run.entry_price_sol, Some(0.01));
        assert_eq!(run.current_token_amount, 100.0);
    }
}
