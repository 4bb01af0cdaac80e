//! Core domain types shared across the trading-state subsystem.
//!
//! Field names and semantics follow spec.md §3 verbatim; this module holds
//! the types that aren't owned by a single component (Wallet, Coin, Target,
//! and the small enums every other module binds against).

use serde::{Deserialize, Serialize};

/// Stable integer identity for a wallet in the registry.
pub type WalletId = i64;

/// Base58-encoded Solana mint address, used as a primary key throughout.
pub type Mint = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = crate::error::ScoundrelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(crate::error::ScoundrelError::validation(format!(
                "unknown side: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    Funding,
    Strategy,
    Kol,
    Deployer,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    None,
    Keychain,
    DbEncrypted,
}

/// Wallet registry entry. `key_ciphertext` is stored opaquely; this crate
/// never decrypts it (key material handling is out of scope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: WalletId,
    pub alias: String,
    pub pubkey: String,
    pub usage_type: UsageType,
    pub is_default_funding: bool,
    pub auto_attach_warchest: bool,
    pub has_private_key: bool,
    pub key_source: KeySource,
    pub key_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinStatus {
    Incomplete,
    Complete,
    Failed,
    Blacklist,
}

/// A mint's market metadata, refreshed opportunistically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coin {
    pub mint: Mint,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub decimals: Option<i64>,
    pub price_sol: Option<f64>,
    pub price_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub market_cap_usd: Option<f64>,
    pub status: CoinStatus,
    pub last_updated: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    New,
    Approved,
    StrongBuy,
    Buy,
    Archived,
    Rejected,
    Avoid,
}

impl TargetStatus {
    /// Never pruned regardless of age.
    pub fn is_sticky(&self) -> bool {
        matches!(self, Self::Approved | Self::StrongBuy | Self::Buy)
    }

    /// Pruned immediately, on the next prune pass.
    pub fn is_immediately_prunable(&self) -> bool {
        matches!(self, Self::Rejected | Self::Avoid)
    }
}

/// A candidate mint discovered by the target-list coordinator (J).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub mint: Mint,
    pub status: TargetStatus,
    pub score: Option<f64>,
    pub confidence: Option<f64>,
    pub mint_verified: bool,
    pub vector_store_id: Option<String>,
    pub last_checked_at: i64,
}

/// Normalize a raw `ms`-or-`s` epoch timestamp to milliseconds.
///
/// Spec.md §4.4 step 1: values below `1e11` are interpreted as a
/// seconds-epoch and multiplied by 1000.
pub fn normalize_to_ms(raw: i64) -> i64 {
    const SECONDS_EPOCH_CEILING: i64 = 100_000_000_000;
    if raw < SECONDS_EPOCH_CEILING {
        raw * 1000
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_seconds_epoch() {
        // 2023-01-01T00:00:00Z in seconds
        let seconds = 1_672_531_200_i64;
        assert_eq!(normalize_to_ms(seconds), seconds * 1000);
    }

    #[test]
    fn leaves_ms_epoch_untouched() {
        let ms = 1_672_531_200_000_i64;
        assert_eq!(normalize_to_ms(ms), ms);
    }

    #[test]
    fn side_round_trips_through_str() {
        use std::str::FromStr;
        assert_eq!(Side::from_str("buy").unwrap(), Side::Buy);
        assert_eq!(Side::from_str("sell").unwrap(), Side::Sell);
        assert!(Side::from_str("hold").is_err());
    }
}
