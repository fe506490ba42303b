use ethers::types::{Address, H256};

/// A `Launched` event observed on the bonding contract. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEvent {
    pub token_address: Address,
    pub pair_address: Address,
    pub block_number: u64,
    /// Launch transaction, used as the de-duplication key.
    pub tx_hash: H256,
}
