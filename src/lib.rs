//! Scoundrel trading-state subsystem.
//!
//! The persistent ledger of trades, the position-run lifecycle, the
//! trade-UUID resolver that binds trade events to position-runs, the PnL
//! aggregation pipeline, the service-level session manager, and the
//! swap-execution worker contract that drives this ledger from external RPC
//! facts.

pub mod artifact;
pub mod config;
pub mod db;
pub mod error;
pub mod evaluation;
pub mod pnl;
pub mod position;
pub mod recorder;
pub mod resolver;
pub mod session;
pub mod swap;
pub mod targetlist;
pub mod types;
pub mod wallet;

pub use config::Config;
pub use db::Db;
pub use error::{Result, ScoundrelError};
