use async_trait::async_trait;
use ethers::types::{Address, TxHash, U256};
use tokio::sync::mpsc;

use crate::error::SniperError;
use crate::models::LaunchEvent;

/// Identifies one live push subscription so it can be detached later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// A submitted but not yet confirmed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub success: bool,
    /// Relays that only hand back a receipt may not echo the hash.
    pub tx_hash: Option<TxHash>,
    pub block_number: Option<u64>,
}

/// What a push listener delivers to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Launch(LaunchEvent),
    Disconnected { endpoint: usize, reason: String },
}

/// Everything the trading engine needs from the chain.
///
/// Every method is bounded in time by the implementation; a call that cannot
/// complete within its bound fails with [`SniperError::Transport`].
#[async_trait]
pub trait ChainTransport: Send + Sync + 'static {
    async fn block_number(&self) -> Result<u64, SniperError>;

    /// `Launched` events in the inclusive block range `[from_block, to_block]`.
    async fn launched_events(&self, from_block: u64, to_block: u64) -> Result<Vec<LaunchEvent>, SniperError>;

    /// Number of push endpoints available to [`ChainTransport::subscribe_launches`].
    fn endpoint_count(&self) -> usize;

    async fn subscribe_launches(
        &self,
        endpoint: usize,
        sink: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<SubscriptionHandle, SniperError>;

    async fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Addresses of the trading wallets, in configuration order.
    fn wallets(&self) -> Vec<Address>;

    async fn submit_buy(&self, wallet: Address, token: Address, amount_in: U256) -> Result<PendingTx, SniperError>;

    async fn submit_sell(&self, wallet: Address, token: Address, amount: U256) -> Result<PendingTx, SniperError>;

    async fn await_confirmation(&self, pending: &PendingTx) -> Result<Receipt, SniperError>;

    /// Balance of `token` held by `wallet`.
    async fn token_balance(&self, wallet: Address, token: Address) -> Result<U256, SniperError>;

    async fn token_symbol(&self, token: Address) -> Result<String, SniperError>;

    /// Base currency the curve would pay right now for `amount` of `token`.
    async fn quote_exit(&self, token: Address, amount: U256) -> Result<U256, SniperError>;

    async fn ensure_sell_allowance(&self, wallet: Address, token: Address, amount: U256) -> Result<(), SniperError>;

    /// Rebuilds the connection and every contract binding in place.
    async fn reconnect(&self) -> Result<(), SniperError>;
}
