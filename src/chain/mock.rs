//! Scriptable in-memory transport used by the engine tests.

use async_trait::async_trait;
use ethers::types::{Address, TxHash, H160, U256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

use crate::chain::transport::{ChainTransport, PendingTx, Receipt, StreamEvent, SubscriptionHandle};
use crate::error::SniperError;
use crate::models::LaunchEvent;

/// Default trading wallet of a fresh mock.
pub const WALLET: Address = H160([0xaa; 20]);

#[derive(Debug, Clone)]
enum Submitted {
    Buy(Address, Address),
    Sell(Address, Address, U256),
}

#[derive(Default)]
pub struct MockState {
    pub height: u64,
    pub fail_height: bool,
    pub events: Vec<LaunchEvent>,
    pub fail_events: bool,
    /// Log queries starting at or after this block fail.
    pub fail_events_from: Option<u64>,
    /// Widest range the provider accepts in one log query.
    pub log_range_cap: Option<u64>,
    pub queried_ranges: Vec<(u64, u64)>,

    pub symbols: HashMap<Address, String>,
    pub wallets: Vec<Address>,
    /// Keyed by (wallet, token).
    pub balances: HashMap<(Address, Address), U256>,
    /// Tokens credited to the wallet by each confirmed buy.
    pub buy_yield: U256,
    pub fail_balance_after_confirm: bool,
    pub confirmed: u32,

    pub quotes: HashMap<Address, U256>,
    pub reject_buys: bool,
    pub reject_wallets: Vec<Address>,
    pub revert_sells: bool,
    pub omit_receipt_hash: bool,
    pub submitted_buys: Vec<(Address, Address)>,
    pub submitted_sells: Vec<(Address, Address, U256)>,
    pub approvals: Vec<(Address, Address)>,

    pub reconnects: u32,
    pub reconnect_failures_remaining: u32,

    pub endpoints: usize,
    pub fail_subscribe: bool,
    pub subscribe_failures_remaining: u32,
    pub subscribe_calls: u32,
    pub live_subscriptions: HashMap<u64, (usize, mpsc::UnboundedSender<StreamEvent>)>,
    next_subscription: u64,

    next_tx: u64,
    pending: HashMap<TxHash, Submitted>,
}

#[derive(Default)]
pub struct MockTransport {
    pub state: Mutex<MockState>,
    /// When set, sell confirmations park until notified.
    pub sell_gate: Option<Arc<Notify>>,
    pub sell_submitted: Arc<Notify>,
}

fn transport_err(what: &str) -> SniperError {
    SniperError::Transport(format!("mock {} unavailable", what))
}

impl MockTransport {
    pub fn new() -> Self {
        let transport = Self::default();
        {
            let mut state = transport.state.lock().unwrap();
            state.buy_yield = U256::from(1_000_000u64);
            state.wallets = vec![WALLET];
        }
        transport
    }

    pub fn with_sell_gate(mut self, gate: Arc<Notify>) -> Self {
        self.sell_gate = Some(gate);
        self
    }

    pub fn with<F: FnOnce(&mut MockState)>(self, f: F) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn set<F: FnOnce(&mut MockState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn read<R, F: FnOnce(&MockState) -> R>(&self, f: F) -> R {
        f(&self.state.lock().unwrap())
    }

    /// Pushes an event to every live listener bound to `endpoint`.
    pub fn emit(&self, endpoint: usize, event: LaunchEvent) {
        let state = self.state.lock().unwrap();
        for (bound, sink) in state.live_subscriptions.values() {
            if *bound == endpoint {
                let _ = sink.send(StreamEvent::Launch(event.clone()));
            }
        }
    }

    pub fn drop_endpoint(&self, endpoint: usize) {
        let state = self.state.lock().unwrap();
        for (bound, sink) in state.live_subscriptions.values() {
            if *bound == endpoint {
                let _ = sink.send(StreamEvent::Disconnected {
                    endpoint,
                    reason: "mock socket closed".to_string(),
                });
            }
        }
    }

    fn next_hash(state: &mut MockState) -> TxHash {
        state.next_tx += 1;
        TxHash::from_low_u64_be(state.next_tx)
    }
}

pub fn launch(token: u8, block: u64, tx: u64) -> LaunchEvent {
    LaunchEvent {
        token_address: Address::repeat_byte(token),
        pair_address: Address::repeat_byte(token.wrapping_add(0x80)),
        block_number: block,
        tx_hash: TxHash::from_low_u64_be(tx),
    }
}

#[async_trait]
impl ChainTransport for MockTransport {
    async fn block_number(&self) -> Result<u64, SniperError> {
        let state = self.state.lock().unwrap();
        if state.fail_height {
            return Err(transport_err("eth_blockNumber"));
        }
        Ok(state.height)
    }

    async fn launched_events(&self, from_block: u64, to_block: u64) -> Result<Vec<LaunchEvent>, SniperError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_events || state.fail_events_from.map_or(false, |from| from_block >= from) {
            return Err(transport_err("getLogs"));
        }
        if let Some(cap) = state.log_range_cap {
            if to_block - from_block + 1 > cap {
                return Err(SniperError::Transport(format!("mock getLogs range exceeds {} blocks", cap)));
            }
        }
        state.queried_ranges.push((from_block, to_block));
        Ok(state
            .events
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }

    fn endpoint_count(&self) -> usize {
        self.state.lock().unwrap().endpoints
    }

    async fn subscribe_launches(
        &self,
        endpoint: usize,
        sink: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<SubscriptionHandle, SniperError> {
        let mut state = self.state.lock().unwrap();
        state.subscribe_calls += 1;
        if state.fail_subscribe {
            return Err(transport_err("eth_subscribe"));
        }
        if state.subscribe_failures_remaining > 0 {
            state.subscribe_failures_remaining -= 1;
            return Err(transport_err("eth_subscribe"));
        }
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.live_subscriptions.insert(id, (endpoint, sink));
        Ok(SubscriptionHandle(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.state.lock().unwrap().live_subscriptions.remove(&handle.0);
    }

    fn wallets(&self) -> Vec<Address> {
        self.state.lock().unwrap().wallets.clone()
    }

    async fn submit_buy(&self, wallet: Address, token: Address, _amount_in: U256) -> Result<PendingTx, SniperError> {
        let mut state = self.state.lock().unwrap();
        if state.reject_buys || state.reject_wallets.contains(&wallet) {
            return Err(SniperError::Confirmation("mock buy rejected".to_string()));
        }
        state.submitted_buys.push((wallet, token));
        let tx_hash = Self::next_hash(&mut state);
        state.pending.insert(tx_hash, Submitted::Buy(wallet, token));
        Ok(PendingTx { tx_hash })
    }

    async fn submit_sell(&self, wallet: Address, token: Address, amount: U256) -> Result<PendingTx, SniperError> {
        let tx_hash = {
            let mut state = self.state.lock().unwrap();
            state.submitted_sells.push((wallet, token, amount));
            let tx_hash = Self::next_hash(&mut state);
            state.pending.insert(tx_hash, Submitted::Sell(wallet, token, amount));
            tx_hash
        };
        self.sell_submitted.notify_one();
        Ok(PendingTx { tx_hash })
    }

    async fn await_confirmation(&self, pending: &PendingTx) -> Result<Receipt, SniperError> {
        let is_sell = matches!(
            self.state.lock().unwrap().pending.get(&pending.tx_hash),
            Some(Submitted::Sell(..))
        );
        if is_sell {
            if let Some(gate) = &self.sell_gate {
                gate.notified().await;
            }
        }

        let mut state = self.state.lock().unwrap();
        let submitted = state
            .pending
            .remove(&pending.tx_hash)
            .ok_or_else(|| SniperError::Confirmation("unknown transaction".to_string()))?;

        let success = match submitted {
            Submitted::Buy(wallet, token) => {
                let credit = state.buy_yield;
                let balance = state.balances.entry((wallet, token)).or_default();
                *balance = balance.saturating_add(credit);
                true
            }
            Submitted::Sell(wallet, token, amount) => {
                if state.revert_sells {
                    false
                } else {
                    let balance = state.balances.entry((wallet, token)).or_default();
                    *balance = balance.saturating_sub(amount);
                    true
                }
            }
        };
        state.confirmed += 1;

        Ok(Receipt {
            success,
            tx_hash: if state.omit_receipt_hash { None } else { Some(pending.tx_hash) },
            block_number: Some(state.height),
        })
    }

    async fn token_balance(&self, wallet: Address, token: Address) -> Result<U256, SniperError> {
        let state = self.state.lock().unwrap();
        if state.fail_balance_after_confirm && state.confirmed > 0 {
            return Err(transport_err("balanceOf"));
        }
        Ok(state.balances.get(&(wallet, token)).copied().unwrap_or_default())
    }

    async fn token_symbol(&self, token: Address) -> Result<String, SniperError> {
        self.state
            .lock()
            .unwrap()
            .symbols
            .get(&token)
            .cloned()
            .ok_or_else(|| transport_err("symbol"))
    }

    async fn quote_exit(&self, token: Address, _amount: U256) -> Result<U256, SniperError> {
        self.state
            .lock()
            .unwrap()
            .quotes
            .get(&token)
            .copied()
            .ok_or_else(|| transport_err("getAmountsOut"))
    }

    async fn ensure_sell_allowance(&self, wallet: Address, token: Address, _amount: U256) -> Result<(), SniperError> {
        self.state.lock().unwrap().approvals.push((wallet, token));
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), SniperError> {
        let mut state = self.state.lock().unwrap();
        state.reconnects += 1;
        if state.reconnect_failures_remaining > 0 {
            state.reconnect_failures_remaining -= 1;
            return Err(transport_err("reconnect"));
        }
        // A successful reconnect heals the height check.
        state.fail_height = false;
        Ok(())
    }
}
