//! Wallet registry operations.
//!
//! `isDefaultFunding` is a process-wide singleton invariant (spec.md §5):
//! setting it is a clear-then-set transaction so uniqueness is preserved
//! even under concurrent callers.

use crate::db::Db;
use crate::error::{Result, ScoundrelError};
use crate::types::{KeySource, UsageType, Wallet, WalletId};
use sqlx::FromRow;
use tracing::instrument;

#[derive(FromRow)]
struct WalletRow {
    wallet_id: WalletId,
    alias: String,
    pubkey: String,
    usage_type: String,
    is_default_funding: i64,
    auto_attach_warchest: i64,
    has_private_key: i64,
    key_source: String,
    key_ref: Option<String>,
}

fn parse_usage_type(s: &str) -> UsageType {
    match s {
        "funding" => UsageType::Funding,
        "strategy" => UsageType::Strategy,
        "kol" => UsageType::Kol,
        "deployer" => UsageType::Deployer,
        _ => UsageType::Other,
    }
}

fn usage_type_str(u: UsageType) -> &'static str {
    match u {
        UsageType::Funding => "funding",
        UsageType::Strategy => "strategy",
        UsageType::Kol => "kol",
        UsageType::Deployer => "deployer",
        UsageType::Other => "other",
    }
}

fn parse_key_source(s: &str) -> KeySource {
    match s {
        "keychain" => KeySource::Keychain,
        "db_encrypted" => KeySource::DbEncrypted,
        _ => KeySource::None,
    }
}

fn key_source_str(k: KeySource) -> &'static str {
    match k {
        KeySource::None => "none",
        KeySource::Keychain => "keychain",
        KeySource::DbEncrypted => "db_encrypted",
    }
}

impl From<WalletRow> for Wallet {
    fn from(row: WalletRow) -> Self {
        Wallet {
            wallet_id: row.wallet_id,
            alias: row.alias,
            pubkey: row.pubkey,
            usage_type: parse_usage_type(&row.usage_type),
            is_default_funding: row.is_default_funding != 0,
            auto_attach_warchest: row.auto_attach_warchest != 0,
            has_private_key: row.has_private_key != 0,
            key_source: parse_key_source(&row.key_source),
            key_ref: row.key_ref,
        }
    }
}

pub struct AddWallet {
    pub alias: String,
    pub pubkey: String,
    pub usage_type: UsageType,
    pub auto_attach_warchest: bool,
    pub key_source: KeySource,
    pub key_ref: Option<String>,
}

#[instrument(skip(db, params), fields(alias = %params.alias))]
pub async fn add(db: &Db, params: AddWallet) -> Result<WalletId> {
    let result = sqlx::query(
        "INSERT INTO wallets (alias, pubkey, usage_type, auto_attach_warchest, has_private_key, key_source, key_ref)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&params.alias)
    .bind(&params.pubkey)
    .bind(usage_type_str(params.usage_type))
    .bind(params.auto_attach_warchest as i64)
    .bind((params.key_source != KeySource::None) as i64)
    .bind(key_source_str(params.key_source))
    .bind(&params.key_ref)
    .execute(db.pool())
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn list(db: &Db) -> Result<Vec<Wallet>> {
    let rows = sqlx::query_as::<_, WalletRow>("SELECT * FROM wallets ORDER BY wallet_id")
        .fetch_all(db.pool())
        .await?;
    Ok(rows.into_iter().map(Wallet::from).collect())
}

pub async fn find_by_alias(db: &Db, alias: &str) -> Result<Wallet> {
    let row = sqlx::query_as::<_, WalletRow>("SELECT * FROM wallets WHERE alias = ?")
        .bind(alias)
        .fetch_optional(db.pool())
        .await?;
    row.map(Wallet::from)
        .ok_or_else(|| ScoundrelError::ResolverNotFound(alias.to_string()))
}

pub async fn remove(db: &Db, wallet_id: WalletId) -> Result<()> {
    sqlx::query("DELETE FROM wallets WHERE wallet_id = ?")
        .bind(wallet_id)
        .execute(db.pool())
        .await?;
    Ok(())
}

/// Clear any existing default-funding wallet, then set the new one, in one
/// transaction, preserving the at-most-one invariant.
#[instrument(skip(db))]
pub async fn set_default_funding(db: &Db, wallet_id: WalletId) -> Result<()> {
    let mut tx = db.pool().begin().await?;
    sqlx::query("UPDATE wallets SET is_default_funding = 0 WHERE is_default_funding = 1")
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE wallets SET is_default_funding = 1 WHERE wallet_id = ?")
        .bind(wallet_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        Db::connect("sqlite::memory:").await.unwrap()
    }

    fn params(alias: &str) -> AddWallet {
        AddWallet {
            alias: alias.into(),
            pubkey: "Fg6PaFpoGXkYsidMpWTK6W2BeZ7FEfcYkg476zPFsLnS".into(),
            usage_type: UsageType::Strategy,
            auto_attach_warchest: false,
            key_source: KeySource::None,
            key_ref: None,
        }
    }

    #[tokio::test]
    async fn add_then_find_round_trips() {
        let db = test_db().await;
        add(&db, params("main")).await.unwrap();
        let wallet = find_by_alias(&db, "main").await.unwrap();
        assert_eq!(wallet.alias, "main");
        assert!(!wallet.is_default_funding);
    }

    #[tokio::test]
    async fn only_one_wallet_can_be_default_funding() {
        let db = test_db().await;
        let a = add(&db, params("a")).await.unwrap();
        let b = add(&db, params("b")).await.unwrap();

        set_default_funding(&db, a).await.unwrap();
        set_default_funding(&db, b).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM wallets WHERE is_default_funding = 1")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);

        let wallet_b = find_by_alias(&db, "b").await.unwrap();
        assert!(wallet_b.is_default_funding);
    }

    #[tokio::test]
    async fn find_by_alias_missing_returns_resolver_not_found() {
        let db = test_db().await;
        let result = find_by_alias(&db, "ghost").await;
        assert!(matches!(result, Err(ScoundrelError::ResolverNotFound(_))));
    }
}
