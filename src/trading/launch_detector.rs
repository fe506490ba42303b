use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::chain::{ChainTransport, StreamEvent, SubscriptionHandle};
use crate::config::{Config, DetectionMode};
use crate::error::SniperError;
use crate::models::LaunchEvent;
use crate::trading::dedup::LaunchDeduplicator;
use crate::trading::reconnect::{Listeners, NoListeners, ReconnectSupervisor};

/// Push listeners on every configured endpoint, all feeding one channel.
///
/// Each arming opens a fresh channel so events from torn-down listeners can
/// never be confused with the new ones. Launches still buffered at teardown
/// are carried over.
pub struct SubscriptionSet<T: ChainTransport> {
    transport: Arc<T>,
    /// Live listeners with the endpoint each one is bound to.
    handles: Vec<(usize, SubscriptionHandle)>,
    sink: mpsc::UnboundedSender<StreamEvent>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    carried: Vec<LaunchEvent>,
}

impl<T: ChainTransport> SubscriptionSet<T> {
    pub fn new(transport: Arc<T>) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        Self {
            transport,
            handles: Vec::new(),
            sink,
            events,
            carried: Vec::new(),
        }
    }

    /// Subscribes on every endpoint that has no live listener yet.
    /// Succeeds if at least one listener is live afterwards.
    pub async fn arm(&mut self) -> Result<usize, SniperError> {
        let endpoints = self.transport.endpoint_count();
        let mut last_error = None;
        for endpoint in 0..endpoints {
            if self.handles.iter().any(|(bound, _)| *bound == endpoint) {
                continue;
            }
            match self.transport.subscribe_launches(endpoint, self.sink.clone()).await {
                Ok(handle) => self.handles.push((endpoint, handle)),
                Err(e) => {
                    warn!("[Detector] Endpoint {} refused subscription: {}", endpoint, e);
                    last_error = Some(e);
                }
            }
        }
        if self.handles.is_empty() {
            return Err(last_error.unwrap_or_else(|| SniperError::Transport("no push endpoints configured".to_string())));
        }
        info!("[Detector] Listening on {}/{} endpoint(s)", self.handles.len(), endpoints);
        Ok(self.handles.len())
    }

    /// Unsubscribes every listener and swaps in a fresh channel.
    pub async fn detach(&mut self) {
        for (_, handle) in self.handles.drain(..) {
            self.transport.unsubscribe(handle).await;
        }
        let (sink, events) = mpsc::unbounded_channel();
        let mut stale = std::mem::replace(&mut self.events, events);
        self.sink = sink;
        while let Ok(event) = stale.try_recv() {
            if let StreamEvent::Launch(launch) = event {
                self.carried.push(launch);
            }
        }
    }

    pub fn armed(&self) -> usize {
        self.handles.len()
    }

    fn take_carried(&mut self) -> Vec<LaunchEvent> {
        std::mem::take(&mut self.carried)
    }
}

#[async_trait]
impl<T: ChainTransport> Listeners for SubscriptionSet<T> {
    async fn teardown(&mut self) {
        self.detach().await;
    }

    async fn rearm(&mut self) -> Result<(), SniperError> {
        // A partially armed set from a failed attempt is discarded first.
        if !self.handles.is_empty() {
            self.detach().await;
        }
        self.arm().await.map(|_| ())
    }
}

/// Discovers launches and forwards each distinct one to the buy pipeline.
///
/// Owned by a single task: the watermark and the de-dup window are plain
/// fields mutated only here.
pub struct LaunchDetector<T: ChainTransport> {
    transport: Arc<T>,
    supervisor: ReconnectSupervisor<T>,
    launches: mpsc::Sender<LaunchEvent>,
    dedup: LaunchDeduplicator,
    last_seen: Option<u64>,
    log_chunk: u64,
    mode: DetectionMode,
    poll_interval: Duration,
    health_interval: Duration,
}

impl<T: ChainTransport> LaunchDetector<T> {
    pub fn new(
        config: &Config,
        transport: Arc<T>,
        supervisor: ReconnectSupervisor<T>,
        launches: mpsc::Sender<LaunchEvent>,
    ) -> Self {
        Self {
            transport,
            supervisor,
            launches,
            dedup: LaunchDeduplicator::new(config.dedup_capacity, config.dedup_ttl()),
            last_seen: None,
            log_chunk: config.log_chunk_blocks.max(1),
            mode: config.detection_mode,
            poll_interval: config.poll_interval(),
            health_interval: config.health_check_interval(),
        }
    }

    pub async fn run(self, shutdown: broadcast::Receiver<()>) {
        match self.mode {
            DetectionMode::Polling => self.run_polling(shutdown).await,
            DetectionMode::Subscription => self.run_subscription(shutdown).await,
        }
    }

    /// One polling cycle. Returns the number of launches forwarded.
    ///
    /// The first cycle only records the current height. Later cycles query
    /// `(last_seen, current]` in chunks of at most `log_chunk` blocks. The
    /// watermark moves past a chunk only after its query succeeds, so a
    /// failed cycle resumes at the first chunk that was not read.
    pub async fn poll_once(&mut self) -> Result<usize, SniperError> {
        let current = self.transport.block_number().await?;

        let mut from = match self.last_seen {
            Some(height) => height + 1,
            None => {
                info!("[Detector] Starting at block {}", current);
                self.last_seen = Some(current);
                return Ok(0);
            }
        };

        let mut forwarded = 0;
        while from <= current {
            let to = current.min(from.saturating_add(self.log_chunk - 1));
            let events = self.transport.launched_events(from, to).await?;
            self.last_seen = Some(to);

            if !events.is_empty() {
                debug!("[Detector] {} launch(es) in blocks {}..={}", events.len(), from, to);
            }
            for event in events {
                if !self.forward(event).await {
                    return Ok(forwarded);
                }
                forwarded += 1;
            }
            from = to + 1;
        }
        Ok(forwarded)
    }

    /// Forwards `event` unless its transaction was already seen.
    /// Returns `false` once the buy pipeline has gone away.
    pub async fn observe(&mut self, event: LaunchEvent) -> bool {
        if !self.dedup.observe(event.tx_hash) {
            debug!("[Detector] Duplicate launch {:?} ignored", event.tx_hash);
            return true;
        }
        self.forward(event).await
    }

    async fn forward(&mut self, event: LaunchEvent) -> bool {
        info!(
            "[Detector] Launch: token {:?}, pair {:?}, block {}, tx {:?}",
            event.token_address, event.pair_address, event.block_number, event.tx_hash
        );
        if self.launches.send(event).await.is_err() {
            warn!("[Detector] Buy pipeline closed, stopping detection");
            return false;
        }
        true
    }

    async fn run_polling(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("[Detector] Polling every {:?}", self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("[Detector] Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(_) => {}
                        Err(e) if e.is_transient() => {
                            warn!("[Detector] Poll failed at watermark {:?}: {}", self.last_seen, e);
                            match self.supervisor.recover(&mut NoListeners).await {
                                Ok(()) => {}
                                Err(e) if e.is_fatal() => {
                                    error!("[Detector] Reconnection exhausted, polling stopped");
                                    break;
                                }
                                Err(e) => {
                                    info!("[Detector] Recovery abandoned: {}", e);
                                    break;
                                }
                            }
                        }
                        Err(e) => error!("[Detector] Poll failed: {}", e),
                    }
                    if self.launches.is_closed() {
                        break;
                    }
                }
            }
        }
        self.log_dedup_stats();
        info!("[Detector] Polling loop finished");
    }

    async fn run_subscription(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut listeners = SubscriptionSet::new(self.transport.clone());
        if let Err(e) = listeners.arm().await {
            warn!("[Detector] Initial subscription failed: {}", e);
            if !self.resubscribe(&mut listeners).await {
                error!("[Detector] Could not establish any subscription, detection stopped");
                listeners.detach().await;
                return;
            }
        }

        let mut health = interval(self.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);
        health.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("[Detector] Shutdown requested");
                    break;
                }
                event = listeners.events.recv() => {
                    let healthy = match event {
                        Some(StreamEvent::Launch(launch)) => {
                            if !self.observe(launch).await {
                                break;
                            }
                            true
                        }
                        Some(StreamEvent::Disconnected { endpoint, reason }) => {
                            warn!("[Detector] Endpoint {} disconnected: {}", endpoint, reason);
                            false
                        }
                        None => false,
                    };
                    if !healthy && !self.resubscribe(&mut listeners).await {
                        break;
                    }
                }
                _ = health.tick() => {
                    if let Err(e) = self.transport.block_number().await {
                        warn!("[Detector] Health check failed: {}", e);
                        if !self.resubscribe(&mut listeners).await {
                            break;
                        }
                    } else if listeners.armed() < self.transport.endpoint_count() {
                        debug!(
                            "[Detector] {}/{} endpoint(s) armed, retrying the rest",
                            listeners.armed(),
                            self.transport.endpoint_count()
                        );
                        if let Err(e) = listeners.arm().await {
                            warn!("[Detector] Re-arming missing endpoints failed: {}", e);
                        }
                    }
                }
            }
        }

        listeners.detach().await;
        self.log_dedup_stats();
        info!("[Detector] Subscription loop finished");
    }

    /// Recovers the transport and replays launches buffered across the rebuild.
    async fn resubscribe(&mut self, listeners: &mut SubscriptionSet<T>) -> bool {
        match self.supervisor.recover(listeners).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!("[Detector] Reconnection exhausted, subscription stopped");
                return false;
            }
            Err(e) => {
                info!("[Detector] Resubscription abandoned: {}", e);
                return false;
            }
        }
        for launch in listeners.take_carried() {
            if !self.observe(launch).await {
                return false;
            }
        }
        true
    }

    fn log_dedup_stats(&self) {
        let stats = self.dedup.stats();
        info!(
            "[Detector] De-dup window: {} checked, {} duplicate(s), {} expired, {} displaced",
            stats.checked, stats.duplicates, stats.expired, stats.displaced
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{launch, MockTransport};
    use crate::config::test_config;
    use crate::trading::reconnect::{ConnectionState, ReconnectGate, RetryPolicy};

    fn detector(
        transport: Arc<MockTransport>,
        mode: DetectionMode,
    ) -> (LaunchDetector<MockTransport>, mpsc::Receiver<LaunchEvent>) {
        detector_with(transport, |config| config.detection_mode = mode)
    }

    fn detector_with<F: FnOnce(&mut Config)>(
        transport: Arc<MockTransport>,
        customize: F,
    ) -> (LaunchDetector<MockTransport>, mpsc::Receiver<LaunchEvent>) {
        let mut config = test_config();
        config.poll_interval_ms = 10;
        config.health_check_interval_ms = 60_000;
        customize(&mut config);
        let supervisor = ReconnectSupervisor::new(
            "detector",
            transport.clone(),
            ReconnectGate::new(),
            RetryPolicy::from_config(&config),
        );
        let (tx, rx) = mpsc::channel(64);
        (LaunchDetector::new(&config, transport, supervisor, tx), rx)
    }

    async fn next_launch(rx: &mut mpsc::Receiver<LaunchEvent>) -> LaunchEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("launch not delivered")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_first_poll_only_sets_watermark() {
        let transport = Arc::new(MockTransport::new().with(|s| {
            s.height = 100;
            s.events.push(launch(1, 90, 1));
        }));
        let (mut det, mut rx) = detector(transport.clone(), DetectionMode::Polling);

        assert_eq!(det.poll_once().await.unwrap(), 0);
        assert_eq!(det.last_seen, Some(100));
        assert!(transport.read(|s| s.queried_ranges.is_empty()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_poll_queries_only_new_ranges() {
        let transport = Arc::new(MockTransport::new().with(|s| s.height = 100));
        let (mut det, mut rx) = detector(transport.clone(), DetectionMode::Polling);
        det.poll_once().await.unwrap();

        transport.set(|s| {
            s.height = 103;
            s.events.push(launch(1, 101, 1));
            s.events.push(launch(2, 103, 2));
        });
        assert_eq!(det.poll_once().await.unwrap(), 2);
        assert_eq!(next_launch(&mut rx).await.token_address, launch(1, 0, 0).token_address);
        assert_eq!(next_launch(&mut rx).await.token_address, launch(2, 0, 0).token_address);

        // Same height again: nothing queried, nothing re-emitted.
        assert_eq!(det.poll_once().await.unwrap(), 0);
        transport.set(|s| s.height = 104);
        assert_eq!(det.poll_once().await.unwrap(), 0);

        assert_eq!(transport.read(|s| s.queried_ranges.clone()), vec![(101, 103), (104, 104)]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_height_failure_keeps_watermark() {
        let transport = Arc::new(MockTransport::new().with(|s| s.height = 100));
        let (mut det, _rx) = detector(transport.clone(), DetectionMode::Polling);
        det.poll_once().await.unwrap();

        transport.set(|s| {
            s.height = 110;
            s.fail_height = true;
        });
        let err = det.poll_once().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(det.last_seen, Some(100));
    }

    #[tokio::test]
    async fn test_log_query_failure_keeps_watermark() {
        let transport = Arc::new(MockTransport::new().with(|s| s.height = 100));
        let (mut det, mut rx) = detector(transport.clone(), DetectionMode::Polling);
        det.poll_once().await.unwrap();

        transport.set(|s| {
            s.height = 105;
            s.fail_events = true;
            s.events.push(launch(1, 102, 1));
        });
        assert!(det.poll_once().await.is_err());
        assert_eq!(det.last_seen, Some(100));

        // The retried cycle covers the whole range.
        transport.set(|s| s.fail_events = false);
        assert_eq!(det.poll_once().await.unwrap(), 1);
        assert_eq!(next_launch(&mut rx).await.block_number, 102);
        assert_eq!(transport.read(|s| s.queried_ranges.clone()), vec![(101, 105)]);
    }

    #[tokio::test]
    async fn test_same_launch_twice_forwards_once() {
        let transport = Arc::new(MockTransport::new());
        let (mut det, mut rx) = detector(transport, DetectionMode::Subscription);

        assert!(det.observe(launch(1, 10, 77)).await);
        assert!(det.observe(launch(1, 10, 77)).await);

        next_launch(&mut rx).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(det.dedup.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_polling_loop_recovers_and_resumes() {
        let transport = Arc::new(MockTransport::new().with(|s| s.height = 100));
        let (det, mut rx) = detector(transport.clone(), DetectionMode::Polling);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(det.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.set(|s| {
            s.fail_height = true;
            s.height = 101;
            s.events.push(launch(3, 101, 3));
        });

        // The supervisor's reconnect clears the failure and the range is picked up.
        assert_eq!(next_launch(&mut rx).await.block_number, 101);
        assert!(transport.read(|s| s.reconnects) >= 1);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_polling_loop_stops_when_retries_exhausted() {
        let transport = Arc::new(MockTransport::new().with(|s| {
            s.fail_height = true;
            s.reconnect_failures_remaining = 100;
        }));
        let (det, _rx) = detector(transport.clone(), DetectionMode::Polling);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::time::timeout(Duration::from_secs(2), det.run(shutdown_rx))
            .await
            .expect("loop should stop on its own");
        assert_eq!(transport.read(|s| s.reconnects), 3);
    }

    #[tokio::test]
    async fn test_redundant_endpoints_first_wins() {
        let transport = Arc::new(MockTransport::new().with(|s| s.endpoints = 2));
        let (det, mut rx) = detector(transport.clone(), DetectionMode::Subscription);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(det.run(shutdown_rx));

        while transport.read(|s| s.live_subscriptions.len()) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.emit(0, launch(4, 200, 40));
        transport.emit(1, launch(4, 200, 40));

        assert_eq!(next_launch(&mut rx).await.tx_hash, launch(4, 200, 40).tx_hash);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(transport.read(|s| s.live_subscriptions.len()), 0);
    }

    #[tokio::test]
    async fn test_disconnect_rearms_without_duplicate_listeners() {
        let transport = Arc::new(MockTransport::new().with(|s| s.endpoints = 2));
        let (det, mut rx) = detector(transport.clone(), DetectionMode::Subscription);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(det.run(shutdown_rx));

        while transport.read(|s| s.live_subscriptions.len()) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.drop_endpoint(0);

        while transport.read(|s| s.reconnects) == 0 || transport.read(|s| s.subscribe_calls) < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(transport.read(|s| s.live_subscriptions.len()), 2);

        transport.emit(1, launch(5, 300, 50));
        assert_eq!(next_launch(&mut rx).await.block_number, 300);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rearm_keeps_buffered_launches() {
        let transport = Arc::new(MockTransport::new().with(|s| s.endpoints = 1));
        let mut set = SubscriptionSet::new(transport.clone());
        set.arm().await.unwrap();

        transport.emit(0, launch(6, 1, 60));
        set.teardown().await;
        assert_eq!(set.armed(), 0);
        assert!(transport.read(|s| s.live_subscriptions.is_empty()));

        set.rearm().await.unwrap();
        assert_eq!(set.armed(), 1);
        assert_eq!(set.take_carried(), vec![launch(6, 1, 60)]);
    }

    #[tokio::test]
    async fn test_supervisor_state_visible() {
        let transport = Arc::new(MockTransport::new());
        let (det, _rx) = detector(transport, DetectionMode::Polling);
        assert_eq!(det.supervisor.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_catch_up_is_queried_in_chunks() {
        let transport = Arc::new(MockTransport::new().with(|s| {
            s.height = 100;
            s.log_range_cap = Some(10);
        }));
        let (mut det, mut rx) = detector_with(transport.clone(), |config| config.log_chunk_blocks = 10);
        det.poll_once().await.unwrap();

        transport.set(|s| {
            s.height = 125;
            s.events.push(launch(1, 105, 1));
            s.events.push(launch(2, 118, 2));
            s.events.push(launch(3, 125, 3));
        });
        assert_eq!(det.poll_once().await.unwrap(), 3);
        assert_eq!(det.last_seen, Some(125));
        assert_eq!(
            transport.read(|s| s.queried_ranges.clone()),
            vec![(101, 110), (111, 120), (121, 125)]
        );
        for block in [105, 118, 125] {
            assert_eq!(next_launch(&mut rx).await.block_number, block);
        }
    }

    #[tokio::test]
    async fn test_failed_chunk_keeps_earlier_progress() {
        let transport = Arc::new(MockTransport::new().with(|s| s.height = 100));
        let (mut det, mut rx) = detector_with(transport.clone(), |config| config.log_chunk_blocks = 10);
        det.poll_once().await.unwrap();

        transport.set(|s| {
            s.height = 125;
            s.fail_events_from = Some(111);
            s.events.push(launch(1, 105, 1));
            s.events.push(launch(2, 115, 2));
        });
        assert!(det.poll_once().await.is_err());
        assert_eq!(det.last_seen, Some(110));
        assert_eq!(next_launch(&mut rx).await.block_number, 105);

        // The next cycle resumes after the last chunk that was read.
        transport.set(|s| s.fail_events_from = None);
        assert_eq!(det.poll_once().await.unwrap(), 1);
        assert_eq!(next_launch(&mut rx).await.block_number, 115);
        assert_eq!(
            transport.read(|s| s.queried_ranges.clone()),
            vec![(101, 110), (111, 120), (121, 125)]
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_health_check_resubscribes() {
        let transport = Arc::new(MockTransport::new().with(|s| s.endpoints = 1));
        let (det, mut rx) = detector_with(transport.clone(), |config| {
            config.detection_mode = DetectionMode::Subscription;
            config.health_check_interval_ms = 20;
        });
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(det.run(shutdown_rx));

        while transport.read(|s| s.live_subscriptions.len()) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.set(|s| s.fail_height = true);

        while transport.read(|s| s.reconnects) == 0 || transport.read(|s| s.subscribe_calls) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(transport.read(|s| s.live_subscriptions.len()), 1);

        transport.emit(0, launch(7, 400, 70));
        assert_eq!(next_launch(&mut rx).await.block_number, 400);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(transport.read(|s| s.live_subscriptions.is_empty()));
    }

    #[tokio::test]
    async fn test_initial_subscription_failure_recovers() {
        let transport = Arc::new(MockTransport::new().with(|s| {
            s.endpoints = 1;
            s.subscribe_failures_remaining = 1;
        }));
        let (det, mut rx) = detector(transport.clone(), DetectionMode::Subscription);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(det.run(shutdown_rx));

        while transport.read(|s| s.live_subscriptions.len()) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(transport.read(|s| s.reconnects), 1);

        transport.emit(0, launch(8, 500, 80));
        assert_eq!(next_launch(&mut rx).await.block_number, 500);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscription_stops_when_no_endpoint_ever_accepts() {
        let transport = Arc::new(MockTransport::new().with(|s| {
            s.endpoints = 1;
            s.fail_subscribe = true;
        }));
        let (det, _rx) = detector(transport.clone(), DetectionMode::Subscription);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::time::timeout(Duration::from_secs(2), det.run(shutdown_rx))
            .await
            .expect("loop should stop on its own");
        assert_eq!(transport.read(|s| s.reconnects), 3);
        assert!(transport.read(|s| s.live_subscriptions.is_empty()));
    }

    #[tokio::test]
    async fn test_health_tick_arms_refused_endpoint() {
        let transport = Arc::new(MockTransport::new().with(|s| {
            s.endpoints = 2;
            s.subscribe_failures_remaining = 1;
        }));
        let (det, _rx) = detector_with(transport.clone(), |config| {
            config.detection_mode = DetectionMode::Subscription;
            config.health_check_interval_ms = 20;
        });
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(det.run(shutdown_rx));

        while transport.read(|s| s.live_subscriptions.len()) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Only the refused endpoint was retried; nothing was rebuilt.
        assert_eq!(transport.read(|s| s.subscribe_calls), 3);
        assert_eq!(transport.read(|s| s.reconnects), 0);
        let mut bound: Vec<usize> = transport.read(|s| s.live_subscriptions.values().map(|(e, _)| *e).collect());
        bound.sort();
        assert_eq!(bound, vec![0, 1]);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_arm_skips_endpoints_already_listening() {
        let transport = Arc::new(MockTransport::new().with(|s| s.endpoints = 2));
        let mut set = SubscriptionSet::new(transport.clone());
        set.arm().await.unwrap();
        set.arm().await.unwrap();

        assert_eq!(set.armed(), 2);
        assert_eq!(transport.read(|s| s.subscribe_calls), 2);
    }
}
