//! Thin wiring demonstration for the Scoundrel trading-state subsystem.
//!
//! Not a CLI: argument parsing and HUD rendering belong to an external
//! collaborator. This just opens the database, runs schema bootstrap, and
//! records a couple of demo trades so the rollup tables have something to
//! show on first run.

use anyhow::Result;
use scoundrel::recorder::{record, RecordTradeInput};
use scoundrel::resolver::Resolver;
use scoundrel::types::Side;
use scoundrel::{Config, Db};
use tracing::{info, Level};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let config = Config::from_env();
    info!(db_path = %config.db_path, "starting scoundrel");

    let db = Db::connect(&config.sqlite_url()).await?;
    let resolver = Resolver::new(db.clone());

    demo_trade_recording(&db, &resolver).await?;

    info!("demo trades recorded, schema bootstrapped at {}", config.db_path);
    Ok(())
}

/// Record a buy and a matching sell so the rollup tables have something to
/// show.
async fn demo_trade_recording(db: &Db, resolver: &Resolver) -> Result<()> {
    let buy = record(
        db,
        resolver,
        RecordTradeInput {
            wallet_id: 1,
            coin_mint: "DemoToken1111111111111111111111111111111".to_string(),
            side: Side::Buy,
            txid: "DemoBuySignature1".to_string(),
            executed_at: now_ms(),
            token_amount: 1000.0,
            sol_amount: 1.0,
            sol_usd_price: Some(150.0),
            program: Some("demo".to_string()),
            ..Default::default()
        },
    )
    .await?;
    info!(txid = %buy.txid, trade_uuid = %buy.trade_uuid, "recorded demo buy");

    let sell = record(
        db,
        resolver,
        RecordTradeInput {
            wallet_id: 1,
            coin_mint: "DemoToken1111111111111111111111111111111".to_string(),
            side: Side::Sell,
            txid: "DemoSellSignature1".to_string(),
            executed_at: now_ms(),
            token_amount: 1000.0,
            sol_amount: 1.3,
            sol_usd_price: Some(155.0),
            program: Some("demo".to_string()),
            ..Default::default()
        },
    )
    .await?;
    info!(txid = %sell.txid, trade_uuid = %sell.trade_uuid, "recorded demo sell");

    Ok(())
}
