pub mod evm;
#[cfg(test)]
pub mod mock;
pub mod transport;

pub use evm::EvmTransport;
pub use transport::{ChainTransport, StreamEvent, SubscriptionHandle};
