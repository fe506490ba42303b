use chrono::Utc;
use ethers::types::U256;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::chain::ChainTransport;
use crate::error::SniperError;
use crate::models::{realized_profit, Trade, TradeStatus, TradeUpdate};
use crate::storage::TradeLedger;
use crate::trading::reconnect::{NoListeners, ReconnectSupervisor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SellOutcome {
    Sold(Trade),
    /// The wallet no longer holds the full position; the trade is closed as failed.
    Failed(Trade),
    /// The trade was already closed when the sell started.
    AlreadyClosed(TradeStatus),
}

/// Exits positions one at a time across the whole process.
pub struct SellExecutor<T: ChainTransport, L: TradeLedger> {
    transport: Arc<T>,
    ledger: Arc<L>,
    supervisor: ReconnectSupervisor<T>,
    in_flight: Mutex<()>,
}

impl<T: ChainTransport, L: TradeLedger> SellExecutor<T, L> {
    pub fn new(transport: Arc<T>, ledger: Arc<L>, supervisor: ReconnectSupervisor<T>) -> Self {
        Self {
            transport,
            ledger,
            supervisor,
            in_flight: Mutex::new(()),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Sells `trade` and logs the result. Transport failures hand over to the
    /// supervisor only after the exclusive section has been released.
    pub async fn on_trigger(&self, trade: Trade, quoted_exit: U256) {
        match self.sell(&trade, quoted_exit).await {
            Ok(SellOutcome::Sold(sold)) => info!(
                "[Seller] Sold trade {} ({:?}) for {}, profit {}",
                sold.id,
                sold.token_address,
                quoted_exit,
                sold.profit.unwrap_or_default()
            ),
            Ok(SellOutcome::Failed(failed)) => warn!(
                "[Seller] Trade {} ({:?}) marked FAILED: {}",
                failed.id,
                failed.token_address,
                failed.failure_reason.as_deref().unwrap_or("unknown")
            ),
            Ok(SellOutcome::AlreadyClosed(status)) => {
                debug!("[Seller] Trade {} already {}", trade.id, status)
            }
            Err(SniperError::SellInFlight) => {
                info!("[Seller] Sell of trade {} rejected: another sell is in flight", trade.id)
            }
            Err(e) if e.is_transient() => {
                warn!("[Seller] Sell of trade {} abandoned: {}", trade.id, e);
                match self.supervisor.recover(&mut NoListeners).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => error!("[Seller] {}", e),
                    Err(e) => debug!("[Seller] Recovery abandoned: {}", e),
                }
            }
            Err(e @ SniperError::Confirmation(_)) => {
                warn!("[Seller] Sell of trade {} not confirmed, stays open: {}", trade.id, e)
            }
            Err(e) => error!("[Seller] Sell of trade {} ({:?}) failed: {}", trade.id, trade.token_address, e),
        }
    }

    /// Exits the full position of `trade` at `quoted_exit`.
    ///
    /// Rejected with [`SniperError::SellInFlight`] while another sell holds the
    /// guard. On any error the trade stays `BOUGHT`.
    pub async fn sell(&self, trade: &Trade, quoted_exit: U256) -> Result<SellOutcome, SniperError> {
        let _guard = self.in_flight.try_lock().map_err(|_| SniperError::SellInFlight)?;
        self.sell_exclusive(trade, quoted_exit).await
    }

    async fn sell_exclusive(&self, trade: &Trade, quoted_exit: U256) -> Result<SellOutcome, SniperError> {
        // The snapshot may be stale; the ledger is authoritative.
        let current = self
            .ledger
            .get(&trade.id)
            .await?
            .ok_or_else(|| SniperError::LedgerInconsistency(format!("sell of unknown trade {}", trade.id)))?;
        if current.status != TradeStatus::Bought {
            return Ok(SellOutcome::AlreadyClosed(current.status));
        }

        let wallet = current.wallet;
        let token = current.token_address;
        let quantity = current.purchased_quantity;
        let profit = realized_profit(current.buy_cost, quoted_exit)?;

        let held = self.transport.token_balance(wallet, token).await?;
        if held < quantity {
            let reason = format!("wallet {:?} holds {} of {:?}, position is {}", wallet, held, token, quantity);
            let failed = self.ledger.update(&current.id, TradeUpdate::Failed { reason }).await?;
            return Ok(SellOutcome::Failed(failed));
        }

        self.transport.ensure_sell_allowance(wallet, token, quantity).await?;
        let pending = self.transport.submit_sell(wallet, token, quantity).await?;
        debug!("[Seller] Sell of trade {} submitted as {:?}", current.id, pending.tx_hash);

        let receipt = self.transport.await_confirmation(&pending).await?;
        if !receipt.success {
            return Err(SniperError::Confirmation(format!("sell {:?} reverted", pending.tx_hash)));
        }

        let sell_id = format!("{:?}", receipt.tx_hash.unwrap_or(pending.tx_hash));
        let sold = self
            .ledger
            .update(
                &current.id,
                TradeUpdate::Sold {
                    sell_id,
                    sell_time: Utc::now(),
                    sold_proceeds: quoted_exit,
                    profit,
                },
            )
            .await?;
        Ok(SellOutcome::Sold(sold))
    }
}
