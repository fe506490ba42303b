use thiserror::Error;

#[derive(Debug, Error)]
pub enum SniperError {
    /// Disconnects, timeouts, rate limits and any other RPC-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A submitted call reverted or was dropped before inclusion.
    #[error("Confirmation failed: {0}")]
    Confirmation(String),

    #[error("Ledger inconsistency: {0}")]
    LedgerInconsistency(String),

    #[error("Reconnection retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Database error: {0}")]
    Ledger(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Another sell is already in flight")]
    SellInFlight,

    /// Recovery was abandoned because the engine is stopping.
    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl SniperError {
    /// Whether the failure should hand control to the reconnection supervisor.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Failures that end the owning loop instead of just the current cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

impl From<sled::Error> for SniperError {
    fn from(e: sled::Error) -> Self {
        Self::Ledger(e.to_string())
    }
}

impl From<serde_json::Error> for SniperError {
    fn from(e: serde_json::Error) -> Self {
        Self::Ledger(format!("Trade codec: {}", e))
    }
}
