//! Swap worker contract (component I).
//!
//! Builds a quote, submits a transaction, monitors confirmation and emits
//! exactly one trade event to the recorder (E). The aggregator call and the
//! on-chain confirmation check are both external collaborators behind narrow
//! async traits rather than called inline; that seam also lets tests inject a
//! fake aggregator/monitor instead of hitting the network.

use crate::db::Db;
use crate::error::{Result, ScoundrelError};
use crate::recorder::{record, RecordTradeInput, TradeEvent};
use crate::resolver::Resolver;
use crate::types::{Mint, Side, WalletId};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_transaction_status::TransactionConfirmationStatus;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, instrument, warn};

pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq)]
pub enum AmountSpec {
    /// `'auto'` or `'100%'`: dump the full balance (panic sell).
    Auto,
    /// `'N%'` with `0 < N <= 100`.
    Percent(f64),
    /// A positive absolute token amount.
    Absolute(f64),
}

impl AmountSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("auto") || trimmed == "100%" {
            return Ok(AmountSpec::Auto);
        }
        if let Some(pct) = trimmed.strip_suffix('%') {
            let value: f64 = pct
                .parse()
                .map_err(|_| ScoundrelError::validation(format!("invalid percent amount: {raw}")))?;
            if value <= 0.0 || value > 100.0 {
                return Err(ScoundrelError::validation(format!("percent amount out of range: {raw}")));
            }
            return Ok(AmountSpec::Percent(value));
        }
        let value: f64 = trimmed
            .parse()
            .map_err(|_| ScoundrelError::validation(format!("invalid amount: {raw}")))?;
        if value <= 0.0 {
            return Err(ScoundrelError::validation("absolute amount must be positive"));
        }
        Ok(AmountSpec::Absolute(value))
    }

    pub fn is_panic(&self, side: Side) -> bool {
        side == Side::Sell && matches!(self, AmountSpec::Auto)
    }

    fn as_absolute(&self) -> Option<f64> {
        match self {
            AmountSpec::Absolute(v) => Some(*v),
            _ => None,
        }
    }
}

/// Resolve `req.amount` to a concrete token amount, reading the wallet's
/// tracked position for the `auto`/`100%`/percent cases per spec.md §4.8.
/// A positive absolute amount passes through unchanged.
async fn resolve_amount_tokens(db: &Db, req: &SwapRequest) -> Result<f64> {
    if let Some(v) = req.amount.as_absolute() {
        return Ok(v);
    }
    if req.side != Side::Sell {
        return Err(ScoundrelError::validation(
            "auto/percent amounts are only valid for sell requests",
        ));
    }

    let run = crate::recorder::position_for(db, req.wallet_id, &req.mint).await?;
    let balance = run.filter(|r| r.is_open()).map(|r| r.current_token_amount).unwrap_or(0.0);
    if balance <= 0.0 {
        return Err(ScoundrelError::validation("no open position to size a sell against"));
    }

    Ok(match req.amount {
        AmountSpec::Auto => balance,
        AmountSpec::Percent(pct) => balance * pct / 100.0,
        AmountSpec::Absolute(_) => unreachable!("handled above"),
    })
}

#[derive(Debug, Clone)]
pub struct SwapRequest {
    pub side: Side,
    pub mint: Mint,
    pub amount: AmountSpec,
    pub wallet_id: WalletId,
    pub wallet_alias: Option<String>,
    pub wallet_pubkey: String,
    pub slippage_percent: f64,
    pub priority_fee_lamports: Option<u64>,
    pub use_jito: bool,
    pub dry_run: bool,
}

fn validate_mint(mint: &str) -> Result<()> {
    if !(32..=44).contains(&mint.len()) {
        return Err(ScoundrelError::validation("mint must be 32-44 characters"));
    }
    bs58::decode(mint)
        .into_vec()
        .map_err(|e| ScoundrelError::validation(format!("mint is not valid base58: {e}")))?;
    Ok(())
}

pub fn validate(req: &SwapRequest) -> Result<()> {
    validate_mint(&req.mint)
}

#[derive(Debug, Clone)]
pub struct Quote {
    pub expected_token_amount: f64,
    pub expected_sol_amount: f64,
    pub price_sol_per_token: f64,
    pub price_impact_pct: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum Confirmation {
    Confirmed {
        network_fee_lamports: u64,
        block_time: Option<i64>,
        slot: Option<u64>,
    },
    Failed {
        reason: String,
        network_fee_lamports: u64,
    },
    Timeout,
}

/// Builds a quote and submits the signed transaction. An external
/// collaborator (the swap aggregator's HTTP API); this crate only specifies
/// the fields it consumes.
#[async_trait]
pub trait SwapAggregator: Send + Sync {
    async fn quote(&self, req: &SwapRequest) -> anyhow::Result<Quote>;
    async fn submit(&self, quote: &Quote, req: &SwapRequest) -> anyhow::Result<String>;
}

/// Polls on-chain status for a submitted signature.
#[async_trait]
pub trait ConfirmationMonitor: Send + Sync {
    async fn confirm(&self, signature: &str, timeout: Duration) -> anyhow::Result<Confirmation>;
}

/// Rate-limits an inner aggregator against a plain fixed quota: the
/// aggregator's HTTP API is the one external dependency worth protecting
/// from a runaway worker loop.
pub struct RateLimitedAggregator<A> {
    inner: A,
    limiter: DefaultDirectRateLimiter,
}

impl<A: SwapAggregator> RateLimitedAggregator<A> {
    pub fn new(inner: A, requests_per_second: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_second.max(1)).unwrap());
        Self {
            inner,
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Blocks until the quota admits one more request, polling `check()`
    /// and sleeping past the earliest retry time it reports.
    async fn wait_for_quota(&self) {
        loop {
            match self.limiter.check() {
                Ok(()) => return,
                Err(not_until) => {
                    tokio::time::sleep(not_until.wait_time_from(governor::clock::QuantaClock::default().now())).await;
                }
            }
        }
    }
}

#[async_trait]
impl<A: SwapAggregator> SwapAggregator for RateLimitedAggregator<A> {
    async fn quote(&self, req: &SwapRequest) -> anyhow::Result<Quote> {
        self.wait_for_quota().await;
        self.inner.quote(req).await
    }

    async fn submit(&self, quote: &Quote, req: &SwapRequest) -> anyhow::Result<String> {
        self.wait_for_quota().await;
        self.inner.submit(quote, req).await
    }
}

#[derive(serde::Deserialize)]
struct QuoteResponse {
    out_amount: f64,
    in_amount: f64,
    price_impact_pct: Option<f64>,
}

#[derive(serde::Deserialize)]
struct SubmitResponse {
    signature: String,
}

/// Real HTTP-backed aggregator client. Quote lookups are retried with
/// exponential backoff; submission is never retried, since a retried submit
/// could double-spend.
pub struct HttpSwapAggregator {
    client: reqwest::Client,
    base_url: String,
    max_retries: usize,
}

impl HttpSwapAggregator {
    pub fn new(base_url: impl Into<String>, max_retries: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            max_retries,
        }
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(5))
            .take(self.max_retries)
    }
}

#[async_trait]
impl SwapAggregator for HttpSwapAggregator {
    async fn quote(&self, req: &SwapRequest) -> anyhow::Result<Quote> {
        let url = format!("{}/quote", self.base_url);
        let mint = req.mint.clone();
        let amount = req.amount.as_absolute().unwrap_or(0.0).to_string();
        let slippage = req.slippage_percent.to_string();
        let priority_fee = req.priority_fee_lamports.map(|v| v.to_string());
        let resp: QuoteResponse = Retry::spawn(self.retry_strategy(), || {
            let client = self.client.clone();
            let url = url.clone();
            let mint = mint.clone();
            let amount = amount.clone();
            let slippage = slippage.clone();
            let priority_fee = priority_fee.clone();
            async move {
                let mut query = vec![("mint", mint.as_str()), ("amount", amount.as_str()), ("slippagePercent", slippage.as_str())];
                if let Some(fee) = priority_fee.as_deref() {
                    query.push(("priorityFeeLamports", fee));
                }
                client
                    .get(&url)
                    .query(&query)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<QuoteResponse>()
                    .await
            }
        })
        .await?;

        Ok(Quote {
            expected_token_amount: resp.out_amount,
            expected_sol_amount: resp.in_amount,
            price_sol_per_token: if resp.out_amount != 0.0 {
                resp.in_amount / resp.out_amount
            } else {
                0.0
            },
            price_impact_pct: resp.price_impact_pct,
        })
    }

    async fn submit(&self, quote: &Quote, req: &SwapRequest) -> anyhow::Result<String> {
        let url = format!("{}/swap", self.base_url);
        let resp: SubmitResponse = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "mint": req.mint,
                "walletPubkey": req.wallet_pubkey,
                "amount": req.amount.as_absolute(),
                "slippagePercent": req.slippage_percent,
                "priorityFeeLamports": req.priority_fee_lamports,
                "expectedTokenAmount": quote.expected_token_amount,
                "expectedSolAmount": quote.expected_sol_amount,
                "useJito": req.use_jito,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.signature)
    }
}

/// Polls `getSignatureStatuses` until the transaction finalizes or the
/// timeout elapses. Balance-diff parsing is not done here; that's what
/// `derive_post_trade_fact` computes from the caller-supplied deltas.
pub struct RpcConfirmationMonitor {
    rpc_client: Arc<RpcClient>,
    poll_interval: Duration,
}

impl RpcConfirmationMonitor {
    pub fn new(rpc_client: Arc<RpcClient>, poll_interval: Duration) -> Self {
        Self {
            rpc_client,
            poll_interval,
        }
    }
}

#[async_trait]
impl ConfirmationMonitor for RpcConfirmationMonitor {
    async fn confirm(&self, signature: &str, timeout: Duration) -> anyhow::Result<Confirmation> {
        let sig = solana_sdk::signature::Signature::from_str(signature)
            .map_err(|e| anyhow::anyhow!("invalid signature: {e}"))?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Ok(Confirmation::Timeout);
            }

            let statuses = self.rpc_client.get_signature_statuses(&[sig]).await?;
            if let Some(Some(status)) = statuses.value.into_iter().next() {
                let finalized = matches!(
                    status.confirmation_status,
                    Some(TransactionConfirmationStatus::Finalized)
                );
                if finalized {
                    if let Some(err) = status.err {
                        return Ok(Confirmation::Failed {
                            reason: format!("{err:?}"),
                            network_fee_lamports: 0,
                        });
                    }
                    debug!(signature, "transaction finalized");
                    return Ok(Confirmation::Confirmed {
                        network_fee_lamports: 0,
                        block_time: None,
                        slot: Some(status.slot),
                    });
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostTradeFact {
    pub token_amount: f64,
    pub sol_amount: f64,
    pub price_sol_per_token: Option<f64>,
}

/// Net token/SOL deltas from a confirmed swap, per spec.md §4.8 step 5.
pub fn derive_post_trade_fact(net_token: f64, net_sol: f64) -> PostTradeFact {
    let price = if net_token.is_finite() && net_sol.is_finite() && net_token != 0.0 {
        Some(net_sol.abs() / net_token.abs())
    } else {
        None
    };
    PostTradeFact {
        token_amount: net_token.abs(),
        sol_amount: net_sol.abs(),
        price_sol_per_token: price,
    }
}

pub enum SwapOutcome {
    DryRun(Quote),
    Recorded(TradeEvent),
    TimedOut,
}

/// Execute a swap request end-to-end: quote, submit, confirm, derive the
/// post-trade fact, and emit exactly one trade event via the recorder.
#[instrument(skip(db, resolver, aggregator, monitor, req), fields(mint = %req.mint, side = ?req.side))]
pub async fn execute(
    db: &Db,
    resolver: &Resolver,
    aggregator: &dyn SwapAggregator,
    monitor: &dyn ConfirmationMonitor,
    mut req: SwapRequest,
) -> anyhow::Result<SwapOutcome> {
    validate(&req)?;

    let resolved_tokens = resolve_amount_tokens(db, &req).await.map_err(anyhow::Error::from)?;
    req.amount = AmountSpec::Absolute(resolved_tokens);

    let quote = aggregator.quote(&req).await?;
    if req.dry_run {
        return Ok(SwapOutcome::DryRun(quote));
    }

    let signature = aggregator.submit(&quote, &req).await?;
    let confirmation = monitor.confirm(&signature, DEFAULT_CONFIRMATION_TIMEOUT).await?;

    match confirmation {
        Confirmation::Timeout => {
            warn!(signature, "swap confirmation timed out, no trade event emitted");
            Ok(SwapOutcome::TimedOut)
        }
        Confirmation::Confirmed { block_time, .. } => {
            let fact = derive_post_trade_fact(quote.expected_token_amount, quote.expected_sol_amount);
            let input = RecordTradeInput {
                wallet_id: req.wallet_id,
                wallet_alias: req.wallet_alias.clone(),
                coin_mint: req.mint.clone(),
                side: req.side,
                txid: signature,
                executed_at: block_time.unwrap_or_else(crate::db::now_ms),
                token_amount: fact.token_amount,
                sol_amount: fact.sol_amount,
                price_sol_per_token: fact.price_sol_per_token,
                program: Some("aggregator".to_string()),
                ..Default::default()
            };
            let event = record(db, resolver, input).await.map_err(anyhow::Error::from)?;
            Ok(SwapOutcome::Recorded(event))
        }
        Confirmation::Failed {
            reason,
            network_fee_lamports,
        } => {
            warn!(reason = %reason, "swap failed on-chain, recording fee-only trade");
            let fees_sol = network_fee_lamports as f64 / 1_000_000_000.0;
            let input = RecordTradeInput {
                wallet_id: req.wallet_id,
                wallet_alias: req.wallet_alias.clone(),
                coin_mint: req.mint.clone(),
                side: Side::Buy,
                txid: format!("failed-{}", uuid::Uuid::new_v4()),
                executed_at: crate::db::now_ms(),
                token_amount: 0.0,
                sol_amount: 0.0,
                fees_sol: Some(fees_sol),
                decision_label: Some("failed_swap".to_string()),
                decision_reason: Some(reason),
                ..Default::default()
            };
            let event = record(db, resolver, input).await.map_err(anyhow::Error::from)?;
            Ok(SwapOutcome::Recorded(event))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_spec_parses_auto_percent_and_absolute() {
        assert_eq!(AmountSpec::parse("auto").unwrap(), AmountSpec::Auto);
        assert_eq!(AmountSpec::parse("100%").unwrap(), AmountSpec::Auto);
        assert_eq!(AmountSpec::parse("25%").unwrap(), AmountSpec::Percent(25.0));
        assert_eq!(AmountSpec::parse("1.5").unwrap(), AmountSpec::Absolute(1.5));
        assert!(AmountSpec::parse("0%").is_err());
        assert!(AmountSpec::parse("150%").is_err());
        assert!(AmountSpec::parse("-1").is_err());
    }

    #[test]
    fn panic_sell_is_only_auto_on_sell_side() {
        assert!(AmountSpec::Auto.is_panic(Side::Sell));
        assert!(!AmountSpec::Auto.is_panic(Side::Buy));
        assert!(!AmountSpec::Percent(50.0).is_panic(Side::Sell));
    }

    #[test]
    fn validate_rejects_non_base58_mint() {
        let req = SwapRequest {
            side: Side::Buy,
            mint: "not-base-58-!!!!".repeat(3),
            amount: AmountSpec::Auto,
            wallet_id: 1,
            wallet_alias: None,
            wallet_pubkey: "x".into(),
            slippage_percent: 1.0,
            priority_fee_lamports: None,
            use_jito: false,
            dry_run: true,
        };
        assert!(validate(&req).is_err());
    }

    #[test]
    fn derive_post_trade_fact_computes_price_from_deltas() {
        let fact = derive_post_trade_fact(100.0, -1.5);
        assert_eq!(fact.token_amount, 100.0);
        assert_eq!(fact.sol_amount, 1.5);
        assert_eq!(fact.price_sol_per_token, Some(0.015));
    }

    #[test]
    fn derive_post_trade_fact_handles_zero_token_delta() {
        let fact = derive_post_trade_fact(0.0, 0.0);
        assert_eq!(fact.price_sol_per_token, None);
    }

    struct CountingAggregator {
        quotes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl SwapAggregator for CountingAggregator {
        async fn quote(&self, _req: &SwapRequest) -> anyhow::Result<Quote> {
            self.quotes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Quote {
                expected_token_amount: 1.0,
                expected_sol_amount: 1.0,
                price_sol_per_token: 1.0,
                price_impact_pct: None,
            })
        }

        async fn submit(&self, _quote: &Quote, _req: &SwapRequest) -> anyhow::Result<String> {
            Ok(format!("fake-{}", rand::random::<u64>()))
        }
    }

    fn fake_req() -> SwapRequest {
        SwapRequest {
            side: Side::Buy,
            mint: "So11111111111111111111111111111111111111112".into(),
            amount: AmountSpec::Absolute(1.0),
            wallet_id: 1,
            wallet_alias: None,
            wallet_pubkey: "x".into(),
            slippage_percent: 1.0,
            priority_fee_lamports: None,
            use_jito: false,
            dry_run: true,
        }
    }

    #[tokio::test]
    async fn auto_amount_resolves_to_the_open_positions_balance() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        let resolver = Resolver::new(db.clone());
        record(
            &db,
            &resolver,
            RecordTradeInput {
                wallet_id: 1,
                coin_mint: fake_req().mint,
                side: Side::Buy,
                txid: "T1".into(),
                executed_at: 1000,
                token_amount: 40.0,
                sol_amount: 0.4,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let mut req = fake_req();
        req.side = Side::Sell;
        req.amount = AmountSpec::Auto;
        assert_eq!(resolve_amount_tokens(&db, &req).await.unwrap(), 40.0);

        req.amount = AmountSpec::Percent(25.0);
        assert_eq!(resolve_amount_tokens(&db, &req).await.unwrap(), 10.0);
    }

    #[tokio::test]
    async fn auto_amount_on_buy_side_is_rejected() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        let mut req = fake_req();
        req.amount = AmountSpec::Auto;
        assert!(resolve_amount_tokens(&db, &req).await.is_err());
    }

    #[tokio::test]
    async fn auto_amount_with_no_open_position_is_rejected() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        let mut req = fake_req();
        req.side = Side::Sell;
        req.amount = AmountSpec::Auto;
        assert!(resolve_amount_tokens(&db, &req).await.is_err());
    }

    #[tokio::test]
    async fn rate_limited_aggregator_delegates_to_inner() {
        let inner = CountingAggregator {
            quotes: std::sync::atomic::AtomicUsize::new(0),
        };
        let limited = RateLimitedAggregator::new(inner, 50);
        let req = fake_req();
        let quote = limited.quote(&req).await.unwrap();
        assert_eq!(quote.expected_token_amount, 1.0);
        let sig = limited.submit(&quote, &req).await.unwrap();
        assert!(sig.starts_with("fake-"));
        assert_eq!(limited.inner.quotes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
