//! Error taxonomy for the trading-state subsystem.
//!
//! Every fallible operation in this crate returns `Result<T, ScoundrelError>`.
//! Call sites that need to interoperate with `anyhow` (the swap worker, the
//! target-list coordinator) convert via `anyhow::Error::from`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScoundrelError {
    /// Malformed input from the caller: bad mint, missing mandatory field,
    /// amount not in an allowed form. Recovered at the entry point.
    #[error("validation error: {0}")]
    Validation(String),

    /// Wallet alias or address not present in the registry.
    #[error("wallet not found: {0}")]
    ResolverNotFound(String),

    /// A unique-index violation detected during a race; the recorder retries
    /// once by re-reading the open row.
    #[error("storage conflict on {entity}: {detail}")]
    StorageConflict { entity: String, detail: String },

    /// An expected constraint is missing on an older database (e.g. no
    /// unique index on `txid`). The recorder adds the constraint and retries
    /// once; a second failure is fatal.
    #[error("storage schema drift: {0}")]
    StorageSchemaDrift(String),

    /// Non-2xx or structured error payload from an upstream API.
    #[error("external api error ({status:?}): {message}")]
    ExternalApi {
        status: Option<u16>,
        message: String,
    },

    /// The swap confirmation monitor exceeded its budget.
    #[error("confirmation timeout after {waited_ms}ms for {signature}")]
    ConfirmationTimeout { signature: String, waited_ms: u64 },

    /// Transaction confirmed with an on-chain error.
    #[error("swap failed: {0}")]
    SwapFailed(String),

    /// A secondary, best-effort write failed. Never rolls back the primary
    /// trade write; callers log and continue.
    #[error("best-effort persistence failed: {0}")]
    PersistenceBestEffort(String),

    /// Underlying storage engine error that doesn't fit a more specific kind.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, ScoundrelError>;

impl ScoundrelError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for the class of storage errors the recorder is allowed to
    /// retry exactly once (conflict or schema drift).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageConflict { .. } | Self::StorageSchemaDrift(_)
        )
    }
}
