use ethers::types::U256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::chain::ChainTransport;
use crate::config::Config;
use crate::error::SniperError;
use crate::storage::TradeLedger;
use crate::trading::reconnect::{NoListeners, ReconnectSupervisor};
use crate::trading::seller::SellExecutor;

const BPS: u64 = 10_000;

/// Exit ratio expressed in basis points so the comparison stays in integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfitThreshold {
    bps: u64,
}

impl ProfitThreshold {
    pub fn from_ratio(ratio: f64) -> Result<Self, SniperError> {
        if !ratio.is_finite() || ratio < 1.0 {
            return Err(SniperError::Config(format!("profit threshold {} must be at least 1.0", ratio)));
        }
        Ok(Self {
            bps: (ratio * BPS as f64).round() as u64,
        })
    }

    pub fn bps(&self) -> u64 {
        self.bps
    }

    /// `quote >= cost * ratio`, evaluated exactly.
    pub fn is_met(&self, buy_cost: U256, quote: U256) -> bool {
        quote.full_mul(U256::from(BPS)) >= buy_cost.full_mul(U256::from(self.bps))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub open: usize,
    pub triggered: usize,
    /// Over threshold but left for a later tick because a sell was running.
    pub deferred: usize,
    pub quote_failures: usize,
    /// At least one quote failed at the transport level.
    pub transport_failed: bool,
}

/// Re-prices open trades on a fixed interval and triggers exits.
///
/// Never writes to the ledger; closing a trade is the seller's job.
pub struct PositionMonitor<T: ChainTransport, L: TradeLedger> {
    transport: Arc<T>,
    ledger: Arc<L>,
    seller: Arc<SellExecutor<T, L>>,
    supervisor: ReconnectSupervisor<T>,
    threshold: ProfitThreshold,
    tick_interval: Duration,
}

impl<T: ChainTransport, L: TradeLedger> PositionMonitor<T, L> {
    pub fn new(
        config: &Config,
        transport: Arc<T>,
        ledger: Arc<L>,
        seller: Arc<SellExecutor<T, L>>,
        supervisor: ReconnectSupervisor<T>,
    ) -> Result<Self, SniperError> {
        Ok(Self {
            transport,
            ledger,
            seller,
            supervisor,
            threshold: ProfitThreshold::from_ratio(config.profit_threshold)?,
            tick_interval: config.monitor_interval(),
        })
    }

    /// Evaluates every open trade once. A failed quote skips only that trade.
    pub async fn tick(&self, sells: &mut JoinSet<()>) -> Result<TickSummary, SniperError> {
        let open = self.ledger.open_trades().await?;
        let mut summary = TickSummary {
            open: open.len(),
            ..Default::default()
        };
        if open.is_empty() {
            return Ok(summary);
        }
        debug!("[Monitor] Evaluating {} open trade(s)", open.len());

        for trade in open {
            let quote = match self.transport.quote_exit(trade.token_address, trade.purchased_quantity).await {
                Ok(quote) => quote,
                Err(e) => {
                    warn!("[Monitor] Quote for trade {} ({:?}) failed: {}", trade.id, trade.token_address, e);
                    summary.quote_failures += 1;
                    summary.transport_failed |= e.is_transient();
                    continue;
                }
            };

            if !self.threshold.is_met(trade.buy_cost, quote) {
                continue;
            }

            if self.seller.is_busy() {
                info!(
                    "[Monitor] Trade {} reached threshold while a sell is in flight, deferring",
                    trade.id
                );
                summary.deferred += 1;
                continue;
            }

            info!(
                "[Monitor] Trade {} ({:?}) reached threshold: quote {} vs cost {}",
                trade.id, trade.token_address, quote, trade.buy_cost
            );
            summary.triggered += 1;
            let seller = self.seller.clone();
            sells.spawn(async move { seller.on_trigger(trade, quote).await });
        }

        Ok(summary)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sells = JoinSet::new();
        info!(
            "[Monitor] Checking positions every {:?} (exit at {} bps of cost)",
            self.tick_interval,
            self.threshold.bps()
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("[Monitor] Shutdown requested");
                    break;
                }
                Some(_) = sells.join_next(), if !sells.is_empty() => {}
                _ = ticker.tick() => {
                    let summary = match self.tick(&mut sells).await {
                        Ok(summary) => summary,
                        Err(e) => {
                            error!("[Monitor] Ledger scan failed: {}", e);
                            continue;
                        }
                    };
                    if summary.open > 0 {
                        debug!(
                            "[Monitor] Tick: {} open, {} triggered, {} deferred, {} quote failure(s)",
                            summary.open, summary.triggered, summary.deferred, summary.quote_failures
                        );
                    }
                    if summary.transport_failed {
                        match self.supervisor.recover(&mut NoListeners).await {
                            Ok(()) => {}
                            Err(e) if e.is_fatal() => {
                                error!("[Monitor] Reconnection exhausted, monitoring stopped");
                                break;
                            }
                            Err(e) => {
                                info!("[Monitor] Recovery abandoned: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        }

        // In-flight sells run to completion.
        while sells.join_next().await.is_some() {}
        info!("[Monitor] Monitoring loop finished");
    }
}
