use ethers::types::{Address, U256};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::chain::ChainTransport;
use crate::config::Config;
use crate::error::SniperError;
use crate::models::{LaunchEvent, Trade};
use crate::storage::TradeLedger;
use crate::trading::reconnect::{NoListeners, ReconnectSupervisor};

/// What happened to one launch.
#[derive(Debug)]
pub enum BuyOutcome {
    /// One result per trading wallet, in wallet order.
    Attempted(Vec<WalletBuy>),
    /// Symbol did not match the configured prefix.
    Skipped { symbol: String },
}

#[derive(Debug)]
pub struct WalletBuy {
    pub wallet: Address,
    pub result: Result<Trade, SniperError>,
}

/// Buys a fixed stake of each launched token from every trading wallet and
/// records one position per wallet.
///
/// Buys share no mutable state and may run concurrently, across tokens and
/// across wallets.
pub struct BuyExecutor<T: ChainTransport, L: TradeLedger> {
    transport: Arc<T>,
    ledger: Arc<L>,
    supervisor: ReconnectSupervisor<T>,
    stake: U256,
    symbol_prefix: Option<String>,
}

impl<T: ChainTransport, L: TradeLedger> BuyExecutor<T, L> {
    pub fn new(config: &Config, transport: Arc<T>, ledger: Arc<L>, supervisor: ReconnectSupervisor<T>) -> Self {
        Self {
            transport,
            ledger,
            supervisor,
            stake: config.stake_amount,
            symbol_prefix: config.symbol_prefix.clone(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.supervisor.is_failed()
    }

    /// Handles one launch end to end. Failures are logged, never retried.
    pub async fn on_launch(&self, event: LaunchEvent) {
        let token = event.token_address;
        let transport_failed = match self.execute(&event).await {
            Ok(BuyOutcome::Attempted(buys)) => {
                let mut transport_failed = false;
                for buy in buys {
                    match buy.result {
                        Ok(trade) => info!(
                            "[Buyer] Bought {} of {:?} for {} from {:?} (trade {})",
                            trade.purchased_quantity, token, trade.buy_cost, buy.wallet, trade.id
                        ),
                        Err(e) => {
                            transport_failed |= e.is_transient();
                            self.report(&event, Some(buy.wallet), &e);
                        }
                    }
                }
                transport_failed
            }
            Ok(BuyOutcome::Skipped { symbol }) => {
                debug!("[Buyer] Skipped {:?} ({})", token, symbol);
                false
            }
            Err(e) => {
                self.report(&event, None, &e);
                e.is_transient()
            }
        };

        if transport_failed {
            match self.supervisor.recover(&mut NoListeners).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => error!("[Buyer] {}", e),
                Err(e) => debug!("[Buyer] Recovery abandoned: {}", e),
            }
        }
    }

    fn report(&self, event: &LaunchEvent, wallet: Option<Address>, e: &SniperError) {
        let token = event.token_address;
        match e {
            SniperError::Transport(_) => warn!("[Buyer] Buy of {:?} ({:?}) abandoned: {}", token, wallet, e),
            SniperError::Confirmation(_) => warn!("[Buyer] Buy of {:?} ({:?}) not confirmed: {}", token, wallet, e),
            _ => error!(
                "[Buyer] Buy of {:?} ({:?}) failed (launch tx {:?}): {}",
                token, wallet, event.tx_hash, e
            ),
        }
    }

    /// Applies the symbol filter once, then buys from every wallet in parallel.
    /// A failed wallet never affects the others.
    pub async fn execute(&self, event: &LaunchEvent) -> Result<BuyOutcome, SniperError> {
        if let Some(prefix) = &self.symbol_prefix {
            let symbol = self.transport.token_symbol(event.token_address).await?;
            if !symbol.to_lowercase().starts_with(prefix.as_str()) {
                return Ok(BuyOutcome::Skipped { symbol });
            }
        }

        let buys = self.transport.wallets().into_iter().map(|wallet| async move {
            WalletBuy {
                wallet,
                result: self.buy_with(wallet, event).await,
            }
        });
        Ok(BuyOutcome::Attempted(join_all(buys).await))
    }

    /// Submits one wallet's buy, waits for it and persists the resulting position.
    ///
    /// The trade is written only after every step succeeded; any error
    /// leaves the ledger untouched.
    async fn buy_with(&self, wallet: Address, event: &LaunchEvent) -> Result<Trade, SniperError> {
        let token = event.token_address;

        let before = self.transport.token_balance(wallet, token).await?;
        let pending = self.transport.submit_buy(wallet, token, self.stake).await?;
        debug!("[Buyer] Buy of {:?} from {:?} submitted as {:?}", token, wallet, pending.tx_hash);

        let receipt = self.transport.await_confirmation(&pending).await?;
        if !receipt.success {
            return Err(SniperError::Confirmation(format!("buy {:?} reverted", pending.tx_hash)));
        }
        debug!("[Buyer] Buy {:?} included in block {:?}", pending.tx_hash, receipt.block_number);

        let after = self.transport.token_balance(wallet, token).await?;
        let purchased = after.checked_sub(before).unwrap_or_default();
        if purchased.is_zero() {
            return Err(SniperError::Confirmation(format!(
                "buy {:?} confirmed but no tokens were received",
                pending.tx_hash
            )));
        }

        let id = match receipt.tx_hash {
            Some(hash) => format!("{:?}", hash),
            None => self.ledger.next_local_id().await?,
        };

        let trade = Trade::bought(id, wallet, token, event.pair_address, self.stake, purchased);
        self.ledger.put(&trade).await?;
        Ok(trade)
    }
}
