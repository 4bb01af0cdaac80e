//! Target-list / pipeline coordinator (component J).
//!
//! Periodic ingestion of candidate mints, run with the same
//! `tokio::time::interval` loop idiom used elsewhere for periodic workers. Each
//! tick upserts the supplied candidates into the `targets` table and applies
//! the prune policy; a one-shot mode runs a single tick and returns.

use crate::db::Db;
use crate::error::Result;
use crate::types::{Mint, TargetStatus, WalletId};
use crate::{evaluation, pnl};
use std::time::Duration;
use tracing::{info, instrument};

/// `approved`/`strong_buy`/`buy` are never pruned by age.
const ARCHIVED_PRUNE_AGE: Duration = Duration::from_secs(7 * 24 * 3600);
const STALE_PRUNE_AGE: Duration = Duration::from_secs(2 * 3600);

/// How far back a tick looks for trade activity to opportunistically
/// maintain, per spec.md §4.9.
const ACTIVITY_LOOKBACK: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct CandidateIngest {
    pub mint: Mint,
    pub status: TargetStatus,
    pub score: Option<f64>,
    pub confidence: Option<f64>,
    pub mint_verified: bool,
    pub vector_store_id: Option<String>,
}

/// Upsert a batch of candidates, updating status/score/confidence/last_checked_at
/// on conflict.
#[instrument(skip(db, candidates))]
pub async fn ingest(db: &Db, candidates: &[CandidateIngest], now_ms: i64) -> Result<()> {
    let mut tx = db.pool().begin().await?;
    for c in candidates {
        sqlx::query(
            "INSERT INTO targets (mint, status, score, confidence, mint_verified, vector_store_id, last_checked_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(mint) DO UPDATE SET
                status = excluded.status,
                score = excluded.score,
                confidence = excluded.confidence,
                mint_verified = excluded.mint_verified,
                vector_store_id = COALESCE(excluded.vector_store_id, vector_store_id),
                last_checked_at = excluded.last_checked_at",
        )
        .bind(&c.mint)
        .bind(status_str(c.status))
        .bind(c.score)
        .bind(c.confidence)
        .bind(c.mint_verified as i64)
        .bind(&c.vector_store_id)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn status_str(status: TargetStatus) -> &'static str {
    match status {
        TargetStatus::New => "new",
        TargetStatus::Approved => "approved",
        TargetStatus::StrongBuy => "strong_buy",
        TargetStatus::Buy => "buy",
        TargetStatus::Archived => "archived",
        TargetStatus::Rejected => "rejected",
        TargetStatus::Avoid => "avoid",
    }
}

/// Delete targets that the prune policy says are eligible, returning the
/// count removed. Sticky statuses are never touched; rejected/avoid go
/// immediately; archived after 7 days; anything else after 2 hours.
#[instrument(skip(db))]
pub async fn prune(db: &Db, now_ms: i64) -> Result<u64> {
    let archived_cutoff = now_ms - ARCHIVED_PRUNE_AGE.as_millis() as i64;
    let stale_cutoff = now_ms - STALE_PRUNE_AGE.as_millis() as i64;

    let result = sqlx::query(
        "DELETE FROM targets WHERE
            status IN ('rejected', 'avoid')
            OR (status = 'archived' AND last_checked_at < ?)
            OR (status NOT IN ('approved', 'strong_buy', 'buy', 'archived', 'rejected', 'avoid') AND last_checked_at < ?)",
    )
    .bind(archived_cutoff)
    .bind(stale_cutoff)
    .execute(db.pool())
    .await?;

    Ok(result.rows_affected())
}

/// Wallet/mint pairs that traded since `since_ms`, per `trades.executed_at`.
async fn mints_with_recent_activity(db: &Db, since_ms: i64) -> Result<Vec<(WalletId, Mint)>> {
    let rows: Vec<(WalletId, Mint)> = sqlx::query_as(
        "SELECT DISTINCT wallet_id, coin_mint FROM trades WHERE executed_at >= ?",
    )
    .bind(since_ms)
    .fetch_all(db.pool())
    .await?;
    Ok(rows)
}

/// For every wallet/mint pair with activity since `since_ms`, rebuild its PnL
/// rollup (§4.5) and record an evaluation snapshot (§4.7) from the result.
/// Best-effort: one pair's failure is logged and does not stop the rest.
async fn maintain_active_mints(db: &Db, since_ms: i64, now_ms: i64) -> Result<usize> {
    let active = mints_with_recent_activity(db, since_ms).await?;
    for (wallet_id, mint) in &active {
        if let Err(e) = pnl::rebuild_for(db, *wallet_id, mint).await {
            tracing::warn!(error = %e, wallet_id, mint, "opportunistic rollup rebuild failed");
            continue;
        }
        let rollup = pnl::per_mint(db, *wallet_id, mint).await?;
        let insert = evaluation::InsertEvaluation {
            ops_type: "targetlist_tick".into(),
            wallet_id: *wallet_id,
            coin_mint: mint.clone(),
            ts_ms: now_ms,
            total_usd: rollup.as_ref().map(|r| r.realized_usd),
            roi_pct: None,
            ..Default::default()
        };
        if let Err(e) = evaluation::insert(db, insert).await {
            tracing::warn!(error = %e, wallet_id, mint, "opportunistic evaluation write failed");
        }
    }
    Ok(active.len())
}

/// Run ingestion + prune + opportunistic maintenance once.
pub async fn run_once(db: &Db, candidates: &[CandidateIngest], now_ms: i64) -> Result<u64> {
    ingest(db, candidates, now_ms).await?;
    let since = now_ms - ACTIVITY_LOOKBACK.as_millis() as i64;
    match maintain_active_mints(db, since, now_ms).await {
        Ok(count) => info!(count, "opportunistic maintenance ran for active mints"),
        Err(e) => tracing::error!(error = %e, "opportunistic maintenance failed"),
    }
    prune(db, now_ms).await
}

/// Periodic daemon loop. `interval` of `None` means "OFF": the function
/// returns immediately after nothing. A real caller feeds `source` from the
/// external market-feed collaborator on every tick.
pub async fn run_daemon<F, Fut>(db: Db, interval: Option<Duration>, mut source: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Vec<CandidateIngest>>,
{
    let Some(interval) = interval else {
        info!("targetlist daemon disabled (interval = OFF)");
        return;
    };

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let candidates = source().await;
        let now = crate::db::now_ms();
        match run_once(&db, &candidates, now).await {
            Ok(pruned) => info!(ingested = candidates.len(), pruned, "targetlist tick complete"),
            Err(e) => tracing::error!(error = %e, "targetlist tick failed"),
        }
    }
}
