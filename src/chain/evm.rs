use async_trait::async_trait;
use ethers::contract::{abigen, ContractError};
use ethers::middleware::{NonceManagerMiddleware, SignerMiddleware};
use ethers::providers::{Http, Middleware, PendingTransaction, Provider, Ws};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, U256, U64};
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain::transport::{ChainTransport, PendingTx, Receipt, StreamEvent, SubscriptionHandle};
use crate::config::Config;
use crate::error::SniperError;
use crate::models::LaunchEvent;

abigen!(
    BondingCurve,
    r#"[
        event Launched(address indexed token, address indexed pair, uint256 launchIndex)
        function buy(uint256 amountIn, address tokenAddress) external payable returns (bool)
        function sell(uint256 amountIn, address tokenAddress) external returns (bool)
    ]"#
);

abigen!(
    CurveRouter,
    r#"[
        function getAmountsOut(address token, address assetToken_, uint256 amountIn) external view returns (uint256 _amountOut)
    ]"#
);

abigen!(
    IERC20,
    r#"[
        function balanceOf(address owner) external view returns (uint256)
        function symbol() external view returns (string)
        function approve(address spender, uint256 amount) external returns (bool)
        function allowance(address owner, address spender) external view returns (uint256)
    ]"#
);

type SignerClient = SignerMiddleware<NonceManagerMiddleware<Provider<Http>>, LocalWallet>;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Static inputs the transport needs to (re)build its bindings.
#[derive(Debug, Clone)]
pub struct EvmSettings {
    pub http_rpc_url: String,
    pub ws_rpc_urls: Vec<String>,
    pub bonding_contract: Address,
    pub router_contract: Address,
    pub asset_token: Address,
    pub rpc_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub gas_limit: u64,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl EvmSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            http_rpc_url: config.http_rpc_url.clone(),
            ws_rpc_urls: config.ws_rpc_urls.clone(),
            bonding_contract: config.bonding_contract,
            router_contract: config.router_contract,
            asset_token: config.asset_token,
            rpc_timeout: config.rpc_timeout(),
            confirmation_timeout: config.confirmation_timeout(),
            gas_limit: config.gas_limit,
            max_fee_per_gas: config.max_fee_per_gas,
            max_priority_fee_per_gas: config.max_priority_fee_per_gas,
        }
    }
}

/// Signing client and bonding binding for one trading wallet.
struct WalletBinding {
    signer: Arc<SignerClient>,
    bonding: BondingCurve<SignerClient>,
}

/// One generation of provider and contract bindings. Replaced wholesale on reconnect.
struct Connection {
    provider: Arc<Provider<Http>>,
    wallets: HashMap<Address, WalletBinding>,
    bonding_reader: BondingCurve<Provider<Http>>,
    router: CurveRouter<Provider<Http>>,
}

impl Connection {
    fn build(settings: &EvmSettings, wallets: &[LocalWallet]) -> Result<Self, SniperError> {
        let provider = Provider::<Http>::try_from(settings.http_rpc_url.as_str())
            .map_err(|e| SniperError::Transport(format!("Invalid HTTP RPC URL {}: {}", settings.http_rpc_url, e)))?
            .interval(RECEIPT_POLL_INTERVAL);
        let provider = Arc::new(provider);

        // Each wallet keeps its own nonce sequence so parallel buys never collide.
        let bindings = wallets
            .iter()
            .map(|wallet| {
                let nonce_manager = NonceManagerMiddleware::new((*provider).clone(), wallet.address());
                let signer = Arc::new(SignerMiddleware::new(nonce_manager, wallet.clone()));
                let binding = WalletBinding {
                    bonding: BondingCurve::new(settings.bonding_contract, signer.clone()),
                    signer,
                };
                (wallet.address(), binding)
            })
            .collect();

        Ok(Self {
            bonding_reader: BondingCurve::new(settings.bonding_contract, provider.clone()),
            router: CurveRouter::new(settings.router_contract, provider.clone()),
            wallets: bindings,
            provider,
        })
    }

    fn wallet(&self, address: Address) -> Result<&WalletBinding, SniperError> {
        self.wallets
            .get(&address)
            .ok_or_else(|| SniperError::Config(format!("No signing key for wallet {:?}", address)))
    }
}

/// [`ChainTransport`] over an EVM JSON-RPC endpoint plus optional WebSocket endpoints.
pub struct EvmTransport {
    settings: EvmSettings,
    wallets: Vec<LocalWallet>,
    connection: RwLock<Arc<Connection>>,
    subscriptions: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_subscription: AtomicU64,
}

impl EvmTransport {
    pub async fn connect(config: &Config) -> Result<Self, SniperError> {
        let settings = EvmSettings::from_config(config);
        let wallets = config
            .wallet_private_keys
            .iter()
            .enumerate()
            .map(|(index, key)| {
                key.trim()
                    .parse::<LocalWallet>()
                    .map(|wallet| wallet.with_chain_id(config.chain_id))
                    .map_err(|e| SniperError::Config(format!("Invalid wallet key #{}: {}", index, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let connection = Connection::build(&settings, &wallets)?;
        let transport = Self {
            settings,
            wallets,
            connection: RwLock::new(Arc::new(connection)),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        };

        let height = transport.block_number().await?;
        info!(
            "Connected to {} at block {} with {} wallet(s)",
            transport.settings.http_rpc_url,
            height,
            transport.wallets.len()
        );
        Ok(transport)
    }

    async fn current(&self) -> Arc<Connection> {
        self.connection.read().await.clone()
    }

    async fn bounded<F, T, E>(&self, what: &str, fut: F) -> Result<T, SniperError>
    where
        F: Future<Output = Result<T, E>> + Send,
        E: Display,
    {
        match tokio::time::timeout(self.settings.rpc_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SniperError::Transport(format!("{} failed: {}", what, e))),
            Err(_) => Err(SniperError::Transport(format!(
                "{} timed out after {:?}",
                what, self.settings.rpc_timeout
            ))),
        }
    }

    fn apply_fee_policy(&self, tx: &mut TypedTransaction) {
        tx.set_gas(self.settings.gas_limit);
        if let TypedTransaction::Eip1559(inner) = tx {
            inner.max_fee_per_gas = Some(self.settings.max_fee_per_gas);
            inner.max_priority_fee_per_gas = Some(self.settings.max_priority_fee_per_gas);
        }
    }

    fn classify_send_error<M: Middleware>(what: &str, e: ContractError<M>) -> SniperError {
        if e.is_revert() {
            SniperError::Confirmation(format!("{} rejected: {}", what, e))
        } else {
            SniperError::Transport(format!("{} submission failed: {}", what, e))
        }
    }
}

#[async_trait]
impl ChainTransport for EvmTransport {
    async fn block_number(&self) -> Result<u64, SniperError> {
        let conn = self.current().await;
        let height = self.bounded("eth_blockNumber", conn.provider.get_block_number()).await?;
        Ok(height.as_u64())
    }

    async fn launched_events(&self, from_block: u64, to_block: u64) -> Result<Vec<LaunchEvent>, SniperError> {
        let conn = self.current().await;
        let query = conn.bonding_reader.launched_filter().from_block(from_block).to_block(to_block);
        let logs = self.bounded("Launched query", query.query_with_meta()).await?;

        Ok(logs
            .into_iter()
            .map(|(event, meta)| LaunchEvent {
                token_address: event.token,
                pair_address: event.pair,
                block_number: meta.block_number.as_u64(),
                tx_hash: meta.transaction_hash,
            })
            .collect())
    }

    fn endpoint_count(&self) -> usize {
        self.settings.ws_rpc_urls.len()
    }

    async fn subscribe_launches(
        &self,
        endpoint: usize,
        sink: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<SubscriptionHandle, SniperError> {
        let url = self
            .settings
            .ws_rpc_urls
            .get(endpoint)
            .cloned()
            .ok_or_else(|| SniperError::Config(format!("No WebSocket endpoint #{}", endpoint)))?;

        let ws = self.bounded("WebSocket connect", Provider::<Ws>::connect(url.as_str())).await?;
        let bonding = BondingCurve::new(self.settings.bonding_contract, Arc::new(ws));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();

        // The event stream borrows the contract binding, so it lives entirely inside the task.
        let task = tokio::spawn(async move {
            let events = bonding.launched_filter();
            let mut stream = match events.subscribe_with_meta().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };

            while let Some(item) = stream.next().await {
                match item {
                    Ok((event, meta)) => {
                        let launch = LaunchEvent {
                            token_address: event.token,
                            pair_address: event.pair,
                            block_number: meta.block_number.as_u64(),
                            tx_hash: meta.transaction_hash,
                        };
                        if sink.send(StreamEvent::Launch(launch)).is_err() {
                            debug!("Launch sink for endpoint #{} dropped, ending listener", endpoint);
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = sink.send(StreamEvent::Disconnected {
                            endpoint,
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
            }

            let _ = sink.send(StreamEvent::Disconnected {
                endpoint,
                reason: "event stream ended".to_string(),
            });
        });

        match tokio::time::timeout(self.settings.rpc_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => {
                task.abort();
                return Err(SniperError::Transport(format!("eth_subscribe on {} failed: {}", url, reason)));
            }
            Ok(Err(_)) => {
                task.abort();
                return Err(SniperError::Transport(format!("Listener for {} exited before subscribing", url)));
            }
            Err(_) => {
                task.abort();
                return Err(SniperError::Transport(format!("eth_subscribe on {} timed out", url)));
            }
        }

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock().await.insert(id, task);
        info!("Subscribed to Launched events on endpoint #{} (handle {})", endpoint, id);
        Ok(SubscriptionHandle(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(task) = self.subscriptions.lock().await.remove(&handle.0) {
            // Dropping the stream sends eth_unsubscribe.
            task.abort();
            debug!("Detached listener {}", handle.0);
        }
    }

    fn wallets(&self) -> Vec<Address> {
        self.wallets.iter().map(|wallet| wallet.address()).collect()
    }

    async fn submit_buy(&self, wallet: Address, token: Address, amount_in: U256) -> Result<PendingTx, SniperError> {
        let conn = self.current().await;
        let mut call = conn.wallet(wallet)?.bonding.buy(amount_in, token);
        self.apply_fee_policy(&mut call.tx);

        let tx_hash = match tokio::time::timeout(self.settings.rpc_timeout, call.send()).await {
            Ok(Ok(pending)) => pending.tx_hash(),
            Ok(Err(e)) => return Err(Self::classify_send_error("buy", e)),
            Err(_) => return Err(SniperError::Transport("buy submission timed out".to_string())),
        };
        debug!("Buy for {:?} from {:?} submitted: {:?}", token, wallet, tx_hash);
        Ok(PendingTx { tx_hash })
    }

    async fn submit_sell(&self, wallet: Address, token: Address, amount: U256) -> Result<PendingTx, SniperError> {
        let conn = self.current().await;
        let mut call = conn.wallet(wallet)?.bonding.sell(amount, token);
        self.apply_fee_policy(&mut call.tx);

        let tx_hash = match tokio::time::timeout(self.settings.rpc_timeout, call.send()).await {
            Ok(Ok(pending)) => pending.tx_hash(),
            Ok(Err(e)) => return Err(Self::classify_send_error("sell", e)),
            Err(_) => return Err(SniperError::Transport("sell submission timed out".to_string())),
        };
        debug!("Sell for {:?} from {:?} submitted: {:?}", token, wallet, tx_hash);
        Ok(PendingTx { tx_hash })
    }

    async fn await_confirmation(&self, pending: &PendingTx) -> Result<Receipt, SniperError> {
        let conn = self.current().await;
        let watcher = PendingTransaction::new(pending.tx_hash, conn.provider.as_ref())
            .interval(RECEIPT_POLL_INTERVAL)
            .confirmations(1);

        match tokio::time::timeout(self.settings.confirmation_timeout, watcher).await {
            Ok(Ok(Some(receipt))) => Ok(Receipt {
                success: receipt.status == Some(U64::from(1)),
                tx_hash: Some(receipt.transaction_hash),
                block_number: receipt.block_number.map(|b| b.as_u64()),
            }),
            Ok(Ok(None)) => Err(SniperError::Confirmation(format!(
                "transaction {:?} was dropped before inclusion",
                pending.tx_hash
            ))),
            Ok(Err(e)) => Err(SniperError::Transport(format!(
                "receipt poll for {:?} failed: {}",
                pending.tx_hash, e
            ))),
            Err(_) => {
                warn!("Timeout waiting for transaction {:?} confirmation", pending.tx_hash);
                Err(SniperError::Transport(format!(
                    "confirmation of {:?} timed out after {:?}",
                    pending.tx_hash, self.settings.confirmation_timeout
                )))
            }
        }
    }

    async fn token_balance(&self, wallet: Address, token: Address) -> Result<U256, SniperError> {
        let conn = self.current().await;
        let erc20 = IERC20::new(token, conn.provider.clone());
        self.bounded("balanceOf", erc20.balance_of(wallet).call()).await
    }

    async fn token_symbol(&self, token: Address) -> Result<String, SniperError> {
        let conn = self.current().await;
        let erc20 = IERC20::new(token, conn.provider.clone());
        self.bounded("symbol", erc20.symbol().call()).await
    }

    async fn quote_exit(&self, token: Address, amount: U256) -> Result<U256, SniperError> {
        let conn = self.current().await;
        let call = conn.router.get_amounts_out(token, self.settings.asset_token, amount);
        self.bounded("getAmountsOut", call.call()).await
    }

    async fn ensure_sell_allowance(&self, wallet: Address, token: Address, amount: U256) -> Result<(), SniperError> {
        let conn = self.current().await;
        let erc20 = IERC20::new(token, conn.wallet(wallet)?.signer.clone());
        let spender = self.settings.bonding_contract;

        let allowance = self
            .bounded("allowance", erc20.allowance(wallet, spender).call())
            .await?;
        if allowance >= amount {
            return Ok(());
        }

        info!("Approving {:?} from {:?} for bonding contract {:?}", token, wallet, spender);
        let mut call = erc20.approve(spender, U256::MAX);
        self.apply_fee_policy(&mut call.tx);
        let tx_hash = match tokio::time::timeout(self.settings.rpc_timeout, call.send()).await {
            Ok(Ok(pending)) => pending.tx_hash(),
            Ok(Err(e)) => return Err(Self::classify_send_error("approve", e)),
            Err(_) => return Err(SniperError::Transport("approve submission timed out".to_string())),
        };

        let receipt = self.await_confirmation(&PendingTx { tx_hash }).await?;
        if !receipt.success {
            return Err(SniperError::Confirmation(format!("approve {:?} reverted", tx_hash)));
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), SniperError> {
        let fresh = Connection::build(&self.settings, &self.wallets)?;
        let height = self
            .bounded("eth_blockNumber", fresh.provider.get_block_number())
            .await
            .map_err(|e| {
                error!("Reconnect check against {} failed: {}", self.settings.http_rpc_url, e);
                e
            })?;

        *self.connection.write().await = Arc::new(fresh);
        info!("Rebuilt provider and contract bindings at block {}", height);
        Ok(())
    }
}

impl Drop for EvmTransport {
    fn drop(&mut self) {
        if let Ok(mut subscriptions) = self.subscriptions.try_lock() {
            for (_, task) in subscriptions.drain() {
                task.abort();
            }
        }
    }
}
