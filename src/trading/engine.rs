use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::chain::ChainTransport;
use crate::config::Config;
use crate::error::SniperError;
use crate::models::LaunchEvent;
use crate::storage::TradeLedger;
use crate::trading::buyer::BuyExecutor;
use crate::trading::launch_detector::LaunchDetector;
use crate::trading::position_monitor::PositionMonitor;
use crate::trading::reconnect::{ReconnectGate, ReconnectSupervisor, RetryPolicy};
use crate::trading::seller::SellExecutor;

const LAUNCH_QUEUE: usize = 256;

/// Runs detection, buying and position monitoring as independent tasks.
pub struct Engine<T: ChainTransport, L: TradeLedger> {
    config: Arc<Config>,
    transport: Arc<T>,
    ledger: Arc<L>,
    /// Shared by the supervisors of the current run; replaced on every start.
    gate: Mutex<Option<Arc<ReconnectGate>>>,
    running: Arc<RwLock<bool>>,
    shutdown_tx: broadcast::Sender<()>,
    task_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<T: ChainTransport, L: TradeLedger> Engine<T, L> {
    pub fn new(config: Arc<Config>, transport: Arc<T>, ledger: Arc<L>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            transport,
            ledger,
            gate: Mutex::new(None),
            running: Arc::new(RwLock::new(false)),
            shutdown_tx,
            task_handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[cfg(test)]
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    fn supervisor(&self, component: &'static str, gate: &Arc<ReconnectGate>) -> ReconnectSupervisor<T> {
        ReconnectSupervisor::new(
            component,
            self.transport.clone(),
            gate.clone(),
            RetryPolicy::from_config(&self.config),
        )
    }

    /// Spawns the detector, the buy dispatcher and the position monitor.
    /// Calling it while already running does nothing.
    pub async fn start(&self) -> Result<(), SniperError> {
        let mut running = self.running.write().await;
        if *running {
            warn!("Engine start requested but already running");
            return Ok(());
        }

        let config = &self.config;
        let gate = ReconnectGate::new();
        let (launch_tx, launch_rx) = mpsc::channel(LAUNCH_QUEUE);

        let detector = LaunchDetector::new(
            config,
            self.transport.clone(),
            self.supervisor("detector", &gate),
            launch_tx,
        );
        let buyer = Arc::new(BuyExecutor::new(
            config,
            self.transport.clone(),
            self.ledger.clone(),
            self.supervisor("buyer", &gate),
        ));
        let seller = Arc::new(SellExecutor::new(
            self.transport.clone(),
            self.ledger.clone(),
            self.supervisor("seller", &gate),
        ));
        let monitor = PositionMonitor::new(
            config,
            self.transport.clone(),
            self.ledger.clone(),
            seller,
            self.supervisor("monitor", &gate),
        )?;
        *self.gate.lock().await = Some(gate);

        let mut handles = self.task_handles.lock().await;
        handles.push(tokio::spawn(detector.run(self.shutdown_tx.subscribe())));
        handles.push(tokio::spawn(dispatch_launches(
            buyer,
            launch_rx,
            self.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(monitor.run(self.shutdown_tx.subscribe())));

        *running = true;
        info!(
            "Engine started ({:?} detection, threshold {}x, stake {} per wallet, {} wallet(s))",
            config.detection_mode,
            config.profit_threshold,
            config.stake_amount,
            self.transport.wallets().len()
        );
        Ok(())
    }

    /// Detaches listeners, halts ticks, waits for in-flight buys and sells
    /// and flushes the ledger. Reconnect backoff is cut short rather than
    /// waited out. Calling it while stopped does nothing.
    pub async fn stop(&self) -> Result<(), SniperError> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }
        info!("Stopping engine...");
        *running = false;
        if let Some(gate) = self.gate.lock().await.take() {
            gate.shut_down();
        }
        let _ = self.shutdown_tx.send(());

        let handles = std::mem::take(&mut *self.task_handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Engine task ended abnormally: {:?}", e);
            }
        }

        self.ledger.flush().await?;
        info!("Engine stopped");
        Ok(())
    }
}

/// Hands each launch to its own buy task. Buys still in flight at shutdown
/// are awaited.
async fn dispatch_launches<T: ChainTransport, L: TradeLedger>(
    buyer: Arc<BuyExecutor<T, L>>,
    mut launches: mpsc::Receiver<LaunchEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buys = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            Some(_) = buys.join_next(), if !buys.is_empty() => {}
            launch = launches.recv() => {
                let Some(launch) = launch else { break };
                if buyer.is_failed() {
                    error!("[Buyer] Reconnection exhausted, no further buys");
                    break;
                }
                let buyer = buyer.clone();
                buys.spawn(async move { buyer.on_launch(launch).await });
            }
        }
    }

    launches.close();
    while buys.join_next().await.is_some() {}
    info!("[Buyer] Dispatcher finished");
}
