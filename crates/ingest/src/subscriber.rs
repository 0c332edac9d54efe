//! Subscriber Lifecycle

use crate::broker::{self, BrokerTask};
use crate::config::SubscriberConfig;
use crate::stats::{IngestSnapshot, IngestStats};
use crate::worker::{self, Worker};
use crate::{InboundMessage, IngestError, IngestFault, StopOutcome, SubscriberState};
use std::sync::Arc;
use storage::ReadingStore;
use telemetry::Decoder;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

/// Pending faults kept until the coordinator reads them
const FAULT_CAPACITY: usize = 4;

struct Running {
    shutdown: watch::Sender<bool>,
    /// Supervisor; completes once the worker task has ended
    worker: JoinHandle<()>,
    worker_abort: AbortHandle,
    broker: Option<JoinHandle<()>>,
}

/// Read-only view of the subscriber for the query side
#[derive(Clone)]
pub struct IngestMonitor {
    stats: Arc<IngestStats>,
    state: watch::Receiver<SubscriberState>,
}

impl IngestMonitor {
    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        self.stats.snapshot()
    }
}

/// Background MQTT subscriber bound to a [`ReadingStore`].
///
/// Holds only a shared handle to the store; the write capability is taken
/// on start and released when the worker exits.
pub struct Subscriber {
    config: SubscriberConfig,
    store: ReadingStore,
    stats: Arc<IngestStats>,
    state: Arc<watch::Sender<SubscriberState>>,
    fault_tx: mpsc::Sender<IngestFault>,
    fault_rx: Option<mpsc::Receiver<IngestFault>>,
    running: Option<Running>,
    stopped: bool,
}

impl Subscriber {
    /// Create a subscriber; nothing runs until it is started
    pub fn new(config: SubscriberConfig, store: ReadingStore) -> Self {
        let (state, _) = watch::channel(SubscriberState::Disconnected);
        let (fault_tx, fault_rx) = mpsc::channel(FAULT_CAPACITY);
        Self {
            config,
            store,
            stats: Arc::new(IngestStats::new()),
            state: Arc::new(state),
            fault_tx,
            fault_rx: Some(fault_rx),
            running: None,
            stopped: false,
        }
    }

    /// Connect to the broker and start ingesting in background tasks.
    /// Returns once the tasks are spawned; connection happens asynchronously.
    pub fn start_in_background(&mut self) -> Result<(), IngestError> {
        let (queue, shutdown) = self.spawn_worker()?;

        let (client, eventloop) = broker::connect(&self.config);
        let task = BrokerTask {
            client,
            topic_pattern: self.config.topic_pattern.clone(),
            reconnect: self.config.reconnect.clone(),
            queue,
            state: self.state.clone(),
            stats: self.stats.clone(),
            faults: self.fault_tx.clone(),
        };
        let handle = tokio::spawn(task.run(eventloop, shutdown));
        if let Some(running) = self.running.as_mut() {
            running.broker = Some(handle);
        }

        info!(
            "Subscriber started: {}:{} topic {}",
            self.config.broker_host, self.config.broker_port, self.config.topic_pattern
        );
        Ok(())
    }

    /// Start the worker without a broker. Messages sent on the returned
    /// sender go through the same decode/append path.
    pub fn start_with_feed(&mut self) -> Result<mpsc::Sender<InboundMessage>, IngestError> {
        let (queue, _) = self.spawn_worker()?;
        self.state.send_replace(SubscriberState::Subscribed);
        info!("Subscriber started with local feed");
        Ok(queue)
    }

    /// Take the store writer and spawn the worker that owns it
    fn spawn_worker(
        &mut self,
    ) -> Result<(mpsc::Sender<InboundMessage>, watch::Receiver<bool>), IngestError> {
        if self.stopped {
            return Err(IngestError::Stopped);
        }
        if self.running.is_some() {
            return Err(IngestError::AlreadyStarted);
        }

        let writer = self.store.writer()?;
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            writer,
            decoder: Decoder::new(self.config.decoder.clone()),
            stats: self.stats.clone(),
            faults: self.fault_tx.clone(),
        };
        let task = tokio::spawn(worker.run(queue_rx, shutdown_rx.clone()));
        let worker_abort = task.abort_handle();
        let handle = tokio::spawn(worker::supervise(task, self.fault_tx.clone()));

        self.running = Some(Running {
            shutdown: shutdown_tx,
            worker: handle,
            worker_abort,
            broker: None,
        });
        Ok((queue_tx, shutdown_rx))
    }

    /// Take the fault receiver. Only the first call returns `Some`.
    pub fn take_faults(&mut self) -> Option<mpsc::Receiver<IngestFault>> {
        self.fault_rx.take()
    }

    /// Observer handle for status reporting
    pub fn monitor(&self) -> IngestMonitor {
        IngestMonitor {
            stats: self.stats.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> IngestSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Stop ingesting. Returns once no further appends can happen: either
    /// the queue drained within `stop_timeout`, or the tasks were aborted.
    /// Safe to call repeatedly and before start.
    pub async fn stop(&mut self) -> StopOutcome {
        self.stopped = true;
        let Some(running) = self.running.take() else {
            self.state.send_replace(SubscriberState::Stopped);
            return StopOutcome::NotRunning;
        };

        info!("Stopping subscriber");
        let Running {
            shutdown,
            mut worker,
            worker_abort,
            mut broker,
        } = running;
        shutdown.send_replace(true);

        let drain = async {
            if let Some(broker) = broker.as_mut() {
                let _ = broker.await;
            }
            let _ = (&mut worker).await;
        };
        let drained = tokio::time::timeout(self.config.stop_timeout, drain)
            .await
            .is_ok();

        let outcome = if drained {
            StopOutcome::Graceful
        } else {
            warn!(
                "Subscriber did not stop within {:?}; aborting",
                self.config.stop_timeout
            );
            if let Some(broker) = broker.filter(|handle| !handle.is_finished()) {
                broker.abort();
                let _ = broker.await;
            }
            worker_abort.abort();
            if !worker.is_finished() {
                let _ = worker.await;
            }
            StopOutcome::Ungraceful
        };

        self.state.send_replace(SubscriberState::Stopped);
        info!("Subscriber stopped ({:?})", outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReconnectPolicy;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use storage::StoreConfig;
    use tempfile::TempDir;
    use telemetry::Metric;

    async fn open_store() -> (TempDir, ReadingStore) {
        let dir = TempDir::new().unwrap();
        let store = ReadingStore::open(&StoreConfig::new(dir.path().join("ingest.db")))
            .await
            .unwrap();
        (dir, store)
    }

    /// Wait until the worker has seen `n` messages
    async fn wait_for_received(subscriber: &Subscriber, n: u64) {
        for _ in 0..200 {
            if subscriber.stats().received >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker saw {} of {} messages", subscriber.stats().received, n);
    }

    #[tokio::test]
    async fn test_valid_message_reaches_store() {
        let (_dir, store) = open_store().await;
        let mut subscriber = Subscriber::new(SubscriberConfig::default(), store.clone());
        let feed = subscriber.start_with_feed().unwrap();

        let payload = r#"{"sensorId":"s1","metric":"temperature","value":21.5,"timestamp":1700000000000}"#;
        feed.send(InboundMessage::now("sensors/s1", payload)).await.unwrap();
        wait_for_received(&subscriber, 1).await;

        assert_eq!(subscriber.stop().await, StopOutcome::Graceful);

        let latest = store.latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.metric, Metric::Temperature);
        assert_eq!(latest.value, 21.5);
        assert_eq!(latest.timestamp, Utc.timestamp_millis_opt(1_700_000_000_000).unwrap());
        assert_eq!(subscriber.stats().accepted, 1);
    }

    #[tokio::test]
    async fn test_decode_failure_is_counted_and_discarded() {
        let (_dir, store) = open_store().await;
        let mut subscriber = Subscriber::new(SubscriberConfig::default(), store.clone());
        let feed = subscriber.start_with_feed().unwrap();

        feed.send(InboundMessage::now("sensors/s1/temperature", "not-json"))
            .await
            .unwrap();
        wait_for_received(&subscriber, 1).await;
        subscriber.stop().await;

        let stats = subscriber.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.accepted, 0);
        assert!(store.all_latest().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_burst_is_fully_persisted() {
        let (_dir, store) = open_store().await;
        let config = SubscriberConfig {
            queue_capacity: 16,
            ..Default::default()
        };
        let mut subscriber = Subscriber::new(config, store.clone());
        let feed = subscriber.start_with_feed().unwrap();

        let base = 1_700_000_000_000i64;
        let n = 200;
        let mut producers = Vec::new();
        for chunk in 0..4 {
            let feed = feed.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..n / 4 {
                    let ts = base + (chunk * (n / 4) + i) as i64;
                    let payload = format!(r#"{{"value":20.0,"timestamp":{ts}}}"#);
                    feed.send(InboundMessage::now("sensors/burst/humidity", payload))
                        .await
                        .unwrap();
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        // Stop drains whatever is still queued
        assert_eq!(subscriber.stop().await, StopOutcome::Graceful);

        let from = Utc.timestamp_millis_opt(base).unwrap();
        let to = Utc.timestamp_millis_opt(base + n as i64).unwrap();
        let rows = store.range("burst", from, to).collect(usize::MAX).await.unwrap();
        assert_eq!(rows.len(), n as usize);
        assert_eq!(subscriber.stats().accepted, n as u64);
    }

    #[tokio::test]
    async fn test_stop_before_traffic_then_close() {
        let (_dir, store) = open_store().await;
        let mut subscriber = Subscriber::new(SubscriberConfig::default(), store.clone());
        let _feed = subscriber.start_with_feed().unwrap();

        assert_eq!(subscriber.stop().await, StopOutcome::Graceful);
        assert_eq!(subscriber.stop().await, StopOutcome::NotRunning);
        assert_eq!(subscriber.state(), SubscriberState::Stopped);

        store.close().await;
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let (_dir, store) = open_store().await;
        let mut subscriber = Subscriber::new(SubscriberConfig::default(), store.clone());

        assert_eq!(subscriber.stop().await, StopOutcome::NotRunning);
        assert!(matches!(subscriber.start_with_feed(), Err(IngestError::Stopped)));
        store.close().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (_dir, store) = open_store().await;
        let mut subscriber = Subscriber::new(SubscriberConfig::default(), store.clone());
        let _feed = subscriber.start_with_feed().unwrap();

        assert!(subscriber.is_running());
        assert!(matches!(subscriber.start_with_feed(), Err(IngestError::AlreadyStarted)));
        subscriber.stop().await;
        assert!(!subscriber.is_running());
    }

    #[tokio::test]
    async fn test_writer_released_after_stop() {
        let (_dir, store) = open_store().await;
        let mut subscriber = Subscriber::new(SubscriberConfig::default(), store.clone());
        let _feed = subscriber.start_with_feed().unwrap();
        assert!(store.writer().is_err());

        subscriber.stop().await;
        assert!(store.writer().is_ok());
    }

    #[tokio::test]
    async fn test_timed_out_stop_aborts_and_releases_store() {
        let (_dir, store) = open_store().await;
        let config = SubscriberConfig {
            queue_capacity: 64,
            stop_timeout: Duration::ZERO,
            ..Default::default()
        };
        let mut subscriber = Subscriber::new(config, store.clone());
        let mut faults = subscriber.take_faults().unwrap();
        let feed = subscriber.start_with_feed().unwrap();

        let base = 1_700_000_000_000i64;
        for i in 0..64 {
            let payload = format!(r#"{{"value":20.0,"timestamp":{}}}"#, base + i);
            feed.try_send(InboundMessage::now("sensors/full/humidity", payload))
                .unwrap();
        }

        assert_eq!(subscriber.stop().await, StopOutcome::Ungraceful);
        assert_eq!(subscriber.state(), SubscriberState::Stopped);
        assert!(!subscriber.is_running());
        assert!(faults.try_recv().is_err());

        let writer = store.writer().unwrap();
        drop(writer);

        tokio::time::timeout(Duration::from_secs(5), store.close())
            .await
            .unwrap();
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_store_failure_escalates_as_fault() {
        let (dir, store) = open_store().await;
        let mut subscriber = Subscriber::new(SubscriberConfig::default(), store.clone());
        let mut faults = subscriber.take_faults().unwrap();
        let feed = subscriber.start_with_feed().unwrap();

        // Break the schema underneath the store
        let url = format!("sqlite://{}", dir.path().join("ingest.db").display());
        let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
        sqlx::query("DROP TABLE readings").execute(&pool).await.unwrap();
        pool.close().await;

        feed.send(InboundMessage::now("sensors/s1/temperature", "20.0"))
            .await
            .unwrap();

        let fault = tokio::time::timeout(Duration::from_secs(5), faults.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(fault, IngestFault::Store(_)));
        assert_eq!(subscriber.stats().append_failures, 1);

        assert_eq!(subscriber.stop().await, StopOutcome::Graceful);
        store.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_broker_becomes_fault() {
        let (_dir, store) = open_store().await;
        let config = SubscriberConfig {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1,
            reconnect: ReconnectPolicy {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(20),
                max_attempts: 2,
            },
            ..Default::default()
        };
        let mut subscriber = Subscriber::new(config, store.clone());
        let mut faults = subscriber.take_faults().unwrap();
        subscriber.start_in_background().unwrap();

        let fault = tokio::time::timeout(Duration::from_secs(10), faults.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(fault, IngestFault::BrokerUnreachable { attempts: 2, .. }));
        assert!(subscriber.stats().reconnects >= 2);

        assert_ne!(subscriber.stop().await, StopOutcome::NotRunning);
        store.close().await;
    }

    #[tokio::test]
    async fn test_monitor_tracks_state() {
        let (_dir, store) = open_store().await;
        let mut subscriber = Subscriber::new(SubscriberConfig::default(), store);
        let monitor = subscriber.monitor();
        assert_eq!(monitor.state(), SubscriberState::Disconnected);

        let _feed = subscriber.start_with_feed().unwrap();
        assert!(monitor.state().is_online());

        subscriber.stop().await;
        assert_eq!(monitor.state(), SubscriberState::Stopped);
    }
}
