use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::chain::ChainTransport;
use crate::config::Config;
use crate::error::SniperError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay: Duration::from_millis(config.reconnect_delay_ms),
            max_delay: Duration::from_millis(config.max_reconnect_delay_ms.max(config.reconnect_delay_ms)),
        }
    }

    /// Capped exponential delay before retrying after failed attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        let spread = (delay.as_millis() as u64) / 4;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connected,
            1 => Self::Reconnecting,
            _ => Self::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Connected => 0,
            Self::Reconnecting => 1,
            Self::Failed => 2,
        }
    }
}

/// Push listeners owned by a component, torn down before and re-armed after a rebuild.
#[async_trait]
pub trait Listeners: Send {
    async fn teardown(&mut self);
    async fn rearm(&mut self) -> Result<(), SniperError>;
}

/// For components that only make request/response calls.
pub struct NoListeners;

#[async_trait]
impl Listeners for NoListeners {
    async fn teardown(&mut self) {}

    async fn rearm(&mut self) -> Result<(), SniperError> {
        Ok(())
    }
}

/// Serializes rebuilds of one shared transport across supervisors and
/// carries the shutdown signal that interrupts their backoff.
pub struct ReconnectGate {
    lock: Mutex<()>,
    generation: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl ReconnectGate {
    pub fn new() -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            shutdown,
        })
    }

    /// Number of successful rebuilds so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Wakes every supervisor sleeping between attempts. Later recoveries
    /// fail immediately with [`SniperError::ShuttingDown`].
    pub fn shut_down(&self) {
        self.shutdown.send_replace(true);
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Per-component reconnection state machine.
///
/// Each component that talks to the transport owns one supervisor, so
/// exhausting the retry budget stops only that component. The transport
/// itself is rebuilt at most once for a burst of failures: a caller that
/// finds a newer generation after acquiring the gate reuses that rebuild.
pub struct ReconnectSupervisor<T: ChainTransport> {
    component: &'static str,
    transport: Arc<T>,
    gate: Arc<ReconnectGate>,
    policy: RetryPolicy,
    state: AtomicU8,
}

impl<T: ChainTransport> ReconnectSupervisor<T> {
    pub fn new(component: &'static str, transport: Arc<T>, gate: Arc<ReconnectGate>, policy: RetryPolicy) -> Self {
        Self {
            component,
            transport,
            gate,
            policy,
            state: AtomicU8::new(ConnectionState::Connected.as_u8()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_failed(&self) -> bool {
        self.state() == ConnectionState::Failed
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Rebuilds the transport and re-arms `listeners`.
    ///
    /// Returns [`SniperError::RetriesExhausted`] once the budget is spent; the
    /// supervisor then stays `Failed` and every later call fails immediately.
    /// Returns [`SniperError::ShuttingDown`] as soon as the gate is shut down,
    /// even in the middle of a backoff sleep.
    pub async fn recover<L: Listeners>(&self, listeners: &mut L) -> Result<(), SniperError> {
        if self.gate.is_shut_down() {
            return Err(SniperError::ShuttingDown);
        }
        if self.is_failed() {
            return Err(SniperError::RetriesExhausted {
                attempts: self.policy.max_attempts,
            });
        }

        let mut observed = self.gate.generation();
        self.set_state(ConnectionState::Reconnecting);
        warn!("[{}] Transport failure, reconnecting", self.component);

        listeners.teardown().await;

        for attempt in 1..=self.policy.max_attempts {
            match self.attempt(&mut observed, listeners).await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    info!("[{}] Reconnected after {} attempt(s)", self.component, attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "[{}] Reconnect attempt {}/{} failed: {}",
                        self.component, attempt, self.policy.max_attempts, e
                    );
                    if attempt < self.policy.max_attempts {
                        tokio::select! {
                            _ = tokio::time::sleep(self.policy.jittered(attempt)) => {}
                            _ = self.gate.shutdown_requested() => {
                                info!("[{}] Shutdown during reconnect backoff", self.component);
                                return Err(SniperError::ShuttingDown);
                            }
                        }
                    }
                }
            }
        }

        self.set_state(ConnectionState::Failed);
        error!(
            "[{}] Giving up after {} reconnect attempts",
            self.component, self.policy.max_attempts
        );
        Err(SniperError::RetriesExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    async fn attempt<L: Listeners>(&self, observed: &mut u64, listeners: &mut L) -> Result<(), SniperError> {
        {
            let _rebuild = self.gate.lock.lock().await;
            let current = self.gate.generation();
            if current == *observed {
                self.transport.reconnect().await?;
                *observed = self.gate.generation.fetch_add(1, Ordering::SeqCst) + 1;
            } else {
                // Someone rebuilt while we waited; a later attempt may rebuild again.
                *observed = current;
            }
        }
        listeners.rearm().await
    }
}
