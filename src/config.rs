//! Process configuration, read once at startup from the environment.
//!
//! Database path, optional RPC endpoint, swap-aggregator API key, AI
//! provider key (opaque, never read by this crate's own logic), and the log
//! level.

use std::env;

const DEFAULT_DB_PATH: &str = "./scoundrel.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub rpc_endpoint: Option<String>,
    pub swap_api_key: Option<String>,
    pub ai_provider_key: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    /// that are safe for local development and tests.
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("SCOUNDREL_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string()),
            rpc_endpoint: env::var("SCOUNDREL_RPC_URL").ok(),
            swap_api_key: env::var("SCOUNDREL_SWAP_API_KEY").ok(),
            ai_provider_key: env::var("SCOUNDREL_AI_API_KEY").ok(),
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }

    pub fn sqlite_url(&self) -> String {
        if self.db_path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", self.db_path)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            rpc_endpoint: None,
            swap_api_key: None,
            ai_provider_key: None,
            log_level: "info".to_string(),
        }
    }
}
