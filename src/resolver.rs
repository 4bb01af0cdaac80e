//! Trade-UUID resolver (component C).
//!
//! Binds a trade event to its position-run identifier, mediating between an
//! in-memory cache, the open `position_runs` row, and the `pending_trade_uuids`
//! side table. The cache uses the `moka` dependency
//! (there it backs a scored-candidate cache; here it backs resolver lookups)
//! rather than a hand-rolled `HashMap` with manual eviction.

use crate::db::Db;
use crate::error::Result;
use crate::types::{Mint, WalletId};
use moka::future::Cache;
use sqlx::Row;
use std::time::Duration;
use tracing::{instrument, warn};

const MIN_CLEANUP_AGE: Duration = Duration::from_secs(60);
const MAX_CLEANUP_LIMIT: i64 = 50_000;

#[derive(Clone)]
pub struct Resolver {
    db: Db,
    cache: Cache<(WalletId, Mint), String>,
}

impl Resolver {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            cache: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(Duration::from_secs(3600))
                .build(),
        }
    }

    /// Resolve the open run's uuid for this pair, consulting cache, then the
    /// authoritative open `position_runs` row, then the pending table.
    #[instrument(skip(self))]
    pub async fn resolve(&self, wallet_id: WalletId, mint: &str) -> Result<Option<String>> {
        let key = (wallet_id, mint.to_string());
        if let Some(uuid) = self.cache.get(&key).await {
            return Ok(Some(uuid));
        }

        let open_row = sqlx::query(
            "SELECT trade_uuid FROM position_runs
             WHERE wallet_id = ? AND coin_mint = ? AND (closed_at = 0 OR closed_at IS NULL)
             ORDER BY open_at DESC LIMIT 1",
        )
        .bind(wallet_id)
        .bind(mint)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(row) = open_row {
            let uuid: String = row.get("trade_uuid");
            self.cache.insert(key, uuid.clone()).await;
            return Ok(Some(uuid));
        }

        let pending = sqlx::query("SELECT trade_uuid FROM pending_trade_uuids WHERE wallet_id = ? AND mint = ?")
            .bind(wallet_id)
            .bind(mint)
            .fetch_optional(self.db.pool())
            .await?;

        if let Some(row) = pending {
            let uuid: String = row.get("trade_uuid");
            self.cache.insert(key, uuid.clone()).await;
            return Ok(Some(uuid));
        }

        Ok(None)
    }

    /// Write-through bind: try the open run first, fall back to pending.
    #[instrument(skip(self))]
    pub async fn bind(&self, wallet_id: WalletId, mint: &str, uuid: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE position_runs SET trade_uuid = ?
             WHERE wallet_id = ? AND coin_mint = ? AND (closed_at = 0 OR closed_at IS NULL)",
        )
        .bind(uuid)
        .bind(wallet_id)
        .bind(mint)
        .execute(self.db.pool())
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO pending_trade_uuids (wallet_id, mint, trade_uuid, created_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (wallet_id, mint) DO UPDATE SET trade_uuid = excluded.trade_uuid, created_at = excluded.created_at",
            )
            .bind(wallet_id)
            .bind(mint)
            .bind(uuid)
            .bind(crate::db::now_ms())
            .execute(self.db.pool())
            .await?;
        }

        self.cache
            .insert((wallet_id, mint.to_string()), uuid.to_string())
            .await;
        Ok(())
    }

    /// Drop all knowledge of a binding for this pair: cache, the open row's
    /// uuid, and any pending row.
    #[instrument(skip(self))]
    pub async fn clear(&self, wallet_id: WalletId, mint: &str) -> Result<()> {
        sqlx::query(
            "UPDATE position_runs SET trade_uuid = NULL
             WHERE wallet_id = ? AND coin_mint = ? AND (closed_at = 0 OR closed_at IS NULL)",
        )
        .bind(wallet_id)
        .bind(mint)
        .execute(self.db.pool())
        .await?;

        sqlx::query("DELETE FROM pending_trade_uuids WHERE wallet_id = ? AND mint = ?")
            .bind(wallet_id)
            .bind(mint)
            .execute(self.db.pool())
            .await?;

        self.cache.invalidate(&(wallet_id, mint.to_string())).await;
        Ok(())
    }

    /// Delete pending rows older than `now - max(60s, max_age)`, oldest
    /// first, up to `limit` rows (clamped to `[1, 50000]`).
    #[instrument(skip(self))]
    pub async fn cleanup_pending(&self, max_age: Duration, limit: i64, now_ms: i64) -> Result<u64> {
        let effective_age = max_age.max(MIN_CLEANUP_AGE);
        let cutoff = now_ms - effective_age.as_millis() as i64;
        let clamped_limit = limit.clamp(1, MAX_CLEANUP_LIMIT);

        if clamped_limit <= 0 {
            warn!("cleanup_pending called with non-positive limit");
        }

        let result = sqlx::query(
            "DELETE FROM pending_trade_uuids WHERE rowid IN (
                SELECT rowid FROM pending_trade_uuids WHERE created_at < ?
                ORDER BY created_at ASC LIMIT ?
             )",
        )
        .bind(cutoff)
        .bind(clamped_limit)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    async fn test_db() -> Db {
        Db::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn resolve_finds_open_run_and_caches_it() {
        let db = test_db().await;
        sqlx::query(
            "INSERT INTO position_runs (wallet_id, coin_mint, trade_uuid, open_at, closed_at)
             VALUES (1, 'M1', 'U1', 1000, 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let resolver = Resolver::new(db);
        let found = resolver.resolve(1, "M1").await.unwrap();
        assert_eq!(found, Some("U1".to_string()));

        // second call should be served from cache
        let cached = resolver.resolve(1, "M1").await.unwrap();
        assert_eq!(cached, Some("U1".to_string()));
    }

    #[tokio::test]
    async fn resolve_falls_back_to_pending_table() {
        let db = test_db().await;
        sqlx::query(
            "INSERT INTO pending_trade_uuids (wallet_id, mint, trade_uuid, created_at)
             VALUES (1, 'M1', 'U-pending', 1000)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let resolver = Resolver::new(db);
        let found = resolver.resolve(1, "M1").await.unwrap();
        assert_eq!(found, Some("U-pending".to_string()));
    }

    #[tokio::test]
    async fn bind_prefers_open_run_over_pending() {
        let db = test_db().await;
        sqlx::query(
            "INSERT INTO position_runs (wallet_id, coin_mint, trade_uuid, open_at, closed_at)
             VALUES (1, 'M1', 'old', 1000, 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let resolver = Resolver::new(db.clone());
        resolver.bind(1, "M1", "new").await.unwrap();

        let row: (String,) = sqlx::query_as("SELECT trade_uuid FROM position_runs WHERE wallet_id = 1 AND coin_mint = 'M1'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.0, "new");

        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_trade_uuids")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn bind_without_open_run_writes_pending() {
        let db = test_db().await;
        let resolver = Resolver::new(db.clone());
        resolver.bind(1, "M1", "fresh").await.unwrap();

        let row: (String,) = sqlx::query_as("SELECT trade_uuid FROM pending_trade_uuids WHERE wallet_id = 1 AND mint = 'M1'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.0, "fresh");
    }

    #[tokio::test]
    async fn cleanup_pending_respects_age_and_limit() {
        let db = test_db().await;
        for i in 0..5 {
            sqlx::query("INSERT INTO pending_trade_uuids (wallet_id, mint, trade_uuid, created_at) VALUES (?, ?, ?, ?)")
                .bind(i)
                .bind(format!("M{i}"))
                .bind(format!("U{i}"))
                .bind(1000 + i)
                .execute(db.pool())
                .await
                .unwrap();
        }

        let resolver = Resolver::new(db.clone());
        let now = 1000 + 5 + MIN_CLEANUP_AGE.as_millis() as i64;
        let deleted = resolver
            .cleanup_pending(Duration::from_secs(1), 2, now)
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_trade_uuids")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 3);
    }
}
