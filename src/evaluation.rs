//! Evaluation store (component H).
//!
//! Append-only per-tick decision/indicator snapshots: one row per
//! observation, queried by trade, mint, or wallet rather than mutated in
//! place.

use crate::db::Db;
use crate::error::Result;
use crate::types::WalletId;
use sqlx::FromRow;
use tracing::instrument;

const MAX_FIELD_LEN: usize = 512;

#[derive(Debug, Clone, FromRow)]
pub struct Evaluation {
    pub id: i64,
    pub ops_type: String,
    pub wallet_id: WalletId,
    pub wallet_alias: Option<String>,
    pub coin_mint: String,
    pub ts_ms: i64,
    pub trade_uuid: Option<String>,
    pub symbol: Option<String>,
    pub strategy_name: Option<String>,
    pub strategy_source: Option<String>,
    pub recommendation: Option<String>,
    pub decision: Option<String>,
    pub regime: Option<String>,
    pub qualify_failed_count: Option<i64>,
    pub qualify_worst_severity: Option<String>,
    pub gate_fail: Option<i64>,
    pub price_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub chart_interval: Option<String>,
    pub chart_points: Option<i64>,
    pub rsi: Option<f64>,
    pub macd_hist: Option<f64>,
    pub vwap: Option<f64>,
    pub warnings_count: Option<i64>,
    pub unreal_usd: Option<f64>,
    pub total_usd: Option<f64>,
    pub roi_pct: Option<f64>,
    pub reasons: Option<String>,
    pub payload: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct InsertEvaluation {
    pub ops_type: String,
    pub wallet_id: WalletId,
    pub wallet_alias: Option<String>,
    pub coin_mint: String,
    pub ts_ms: i64,
    pub trade_uuid: Option<String>,
    pub symbol: Option<String>,
    pub strategy_name: Option<String>,
    pub strategy_source: Option<String>,
    pub recommendation: Option<String>,
    pub decision: Option<String>,
    pub regime: Option<String>,
    pub qualify_failed_count: Option<i64>,
    pub qualify_worst_severity: Option<String>,
    pub gate_fail: Option<bool>,
    pub price_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub chart_interval: Option<String>,
    pub chart_points: Option<i64>,
    pub rsi: Option<f64>,
    pub macd_hist: Option<f64>,
    pub vwap: Option<f64>,
    pub warnings_count: Option<i64>,
    pub unreal_usd: Option<f64>,
    pub total_usd: Option<f64>,
    pub roi_pct: Option<f64>,
    pub reasons: Option<serde_json::Value>,
    pub payload: Option<serde_json::Value>,
}

fn clamp(field: Option<String>) -> Option<String> {
    field.map(|s| {
        let trimmed = s.trim();
        if trimmed.len() > MAX_FIELD_LEN {
            trimmed[..MAX_FIELD_LEN].to_string()
        } else {
            trimmed.to_string()
        }
    })
}

#[instrument(skip(db, input), fields(mint = %input.coin_mint, ops_type = %input.ops_type))]
pub async fn insert(db: &Db, input: InsertEvaluation) -> Result<i64> {
    let reasons_json = input.reasons.map(|v| v.to_string());
    let payload_json = input.payload.map(|v| v.to_string());

    let result = sqlx::query(
        "INSERT INTO evaluations (
            ops_type, wallet_id, wallet_alias, coin_mint, ts_ms, trade_uuid, symbol,
            strategy_name, strategy_source, recommendation, decision, regime,
            qualify_failed_count, qualify_worst_severity, gate_fail, price_usd, liquidity_usd,
            chart_interval, chart_points, rsi, macd_hist, vwap, warnings_count, unreal_usd,
            total_usd, roi_pct, reasons, payload, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&input.ops_type)
    .bind(input.wallet_id)
    .bind(clamp(input.wallet_alias))
    .bind(&input.coin_mint)
    .bind(input.ts_ms)
    .bind(&input.trade_uuid)
    .bind(clamp(input.symbol))
    .bind(clamp(input.strategy_name))
    .bind(clamp(input.strategy_source))
    .bind(clamp(input.recommendation))
    .bind(clamp(input.decision))
    .bind(clamp(input.regime))
    .bind(input.qualify_failed_count)
    .bind(clamp(input.qualify_worst_severity))
    .bind(input.gate_fail.map(|b| b as i64))
    .bind(input.price_usd)
    .bind(input.liquidity_usd)
    .bind(clamp(input.chart_interval))
    .bind(input.chart_points)
    .bind(input.rsi)
    .bind(input.macd_hist)
    .bind(input.vwap)
    .bind(input.warnings_count)
    .bind(input.unreal_usd)
    .bind(input.total_usd)
    .bind(input.roi_pct)
    .bind(reasons_json)
    .bind(payload_json)
    .bind(crate::db::now_ms())
    .execute(db.pool())
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn latest_by_trade(db: &Db, trade_uuid: &str, ops_type: Option<&str>) -> Result<Option<Evaluation>> {
    let row = sqlx::query_as::<_, Evaluation>(
        "SELECT * FROM evaluations WHERE trade_uuid = ? AND (? IS NULL OR ops_type = ?)
         ORDER BY ts_ms DESC LIMIT 1",
    )
    .bind(trade_uuid)
    .bind(ops_type)
    .bind(ops_type)
    .fetch_optional(db.pool())
    .await?;
    Ok(row)
}

pub async fn latest_by_mint(db: &Db, coin_mint: &str, ops_type: Option<&str>) -> Result<Option<Evaluation>> {
    let row = sqlx::query_as::<_, Evaluation>(
        "SELECT * FROM evaluations WHERE coin_mint = ? AND (? IS NULL OR ops_type = ?)
         ORDER BY ts_ms DESC LIMIT 1",
    )
    .bind(coin_mint)
    .bind(ops_type)
    .bind(ops_type)
    .fetch_optional(db.pool())
    .await?;
    Ok(row)
}

pub async fn list_by_trade_in_range(
    db: &Db,
    trade_uuid: &str,
    from_ms: i64,
    to_ms: i64,
    ops_type: Option<&str>,
) -> Result<Vec<Evaluation>> {
    let rows = sqlx::query_as::<_, Evaluation>(
        "SELECT * FROM evaluations
         WHERE trade_uuid = ? AND ts_ms BETWEEN ? AND ? AND (? IS NULL OR ops_type = ?)
         ORDER BY ts_ms ASC",
    )
    .bind(trade_uuid)
    .bind(from_ms)
    .bind(to_ms)
    .bind(ops_type)
    .bind(ops_type)
    .fetch_all(db.pool())
    .await?;
    Ok(rows)
}

pub async fn list_by_mint(db: &Db, coin_mint: &str, ops_type: Option<&str>, limit: i64) -> Result<Vec<Evaluation>> {
    let rows = sqlx::query_as::<_, Evaluation>(
        "SELECT * FROM evaluations WHERE coin_mint = ? AND (? IS NULL OR ops_type = ?)
         ORDER BY ts_ms DESC LIMIT ?",
    )
    .bind(coin_mint)
    .bind(ops_type)
    .bind(ops_type)
    .bind(limit)
    .fetch_all(db.pool())
    .await?;
    Ok(rows)
}

pub async fn list_recent_by_wallet(db: &Db, wallet_id: WalletId, ops_type: Option<&str>, limit: i64) -> Result<Vec<Evaluation>> {
    let rows = sqlx::query_as::<_, Evaluation>(
        "SELECT * FROM evaluations WHERE wallet_id = ? AND (? IS NULL OR ops_type = ?)
         ORDER BY ts_ms DESC LIMIT ?",
    )
    .bind(wallet_id)
    .bind(ops_type)
    .bind(ops_type)
    .bind(limit)
    .fetch_all(db.pool())
    .await?;
    Ok(rows)
}

pub async fn delete_by_trade(db: &Db, trade_uuid: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM evaluations WHERE trade_uuid = ?")
        .bind(trade_uuid)
        .execute(db.pool())
        .await?;
    Ok(result.rows_affected())
}

pub async fn prune_older_than(db: &Db, cutoff_ms: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM evaluations WHERE ts_ms < ?")
        .bind(cutoff_ms)
        .execute(db.pool())
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        Db::connect("sqlite::memory:").await.unwrap()
    }

    fn sample(mint: &str, ts_ms: i64) -> InsertEvaluation {
        InsertEvaluation {
            ops_type: "buyOps".into(),
            wallet_id: 1,
            coin_mint: mint.into(),
            ts_ms,
            trade_uuid: Some("U1".into()),
            recommendation: Some("  buy now  ".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_then_fetch_latest_by_trade() {
        let db = test_db().await;
        insert(&db, sample("M1", 1000)).await.unwrap();
        insert(&db, sample("M1", 2000)).await.unwrap();

        let latest = latest_by_trade(&db, "U1", None).await.unwrap().unwrap();
        assert_eq!(latest.ts_ms, 2000);
        assert_eq!(latest.recommendation.as_deref(), Some("buy now"));
    }

    #[tokio::test]
    async fn ops_type_filter_is_respected() {
        let db = test_db().await;
        insert(&db, sample("M1", 1000)).await.unwrap();
        let mut sell = sample("M1", 2000);
        sell.ops_type = "sellOps".into();
        insert(&db, sell).await.unwrap();

        let buy_only = latest_by_trade(&db, "U1", Some("buyOps")).await.unwrap().unwrap();
        assert_eq!(buy_only.ops_type, "buyOps");
    }

    #[tokio::test]
    async fn range_query_and_prune() {
        let db = test_db().await;
        insert(&db, sample("M1", 1000)).await.unwrap();
        insert(&db, sample("M1", 5000)).await.unwrap();

        let in_range = list_by_trade_in_range(&db, "U1", 0, 2000, None).await.unwrap();
        assert_eq!(in_range.len(), 1);

        let pruned = prune_older_than(&db, 2000).await.unwrap();
        assert_eq!(pruned, 1);
    }
}
