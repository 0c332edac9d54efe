//! MQTT Event Loop Task

use crate::config::{ReconnectPolicy, SubscriberConfig};
use crate::stats::IngestStats;
use crate::{InboundMessage, IngestFault, SubscriberState};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Requests the client may queue before `try_*` calls fail
const CLIENT_CAPACITY: usize = 64;

/// Upper bound on flushing UNSUBSCRIBE/DISCONNECT at shutdown
const DISCONNECT_FLUSH: Duration = Duration::from_secs(1);

pub(crate) fn connect(config: &SubscriberConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.broker_host.clone(),
        config.broker_port,
    );
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);

    AsyncClient::new(options, CLIENT_CAPACITY)
}

pub(crate) struct BrokerTask {
    pub client: AsyncClient,
    pub topic_pattern: String,
    pub reconnect: ReconnectPolicy,
    pub queue: mpsc::Sender<InboundMessage>,
    pub state: Arc<watch::Sender<SubscriberState>>,
    pub stats: Arc<IngestStats>,
    pub faults: mpsc::Sender<IngestFault>,
}

impl BrokerTask {
    /// Poll the event loop until shutdown or reconnect exhaustion.
    /// Dropping `self` at the end closes the queue's sending side.
    pub(crate) async fn run(self, mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;
        let mut connected = false;
        self.state.send_replace(SubscriberState::Connecting);

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    failures = 0;
                    connected = true;
                    info!("Connected to MQTT broker, subscribing to {}", self.topic_pattern);
                    if let Err(e) = self
                        .client
                        .try_subscribe(self.topic_pattern.clone(), QoS::AtMostOnce)
                    {
                        warn!("Subscribe request failed: {}", e);
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    self.state.send_replace(SubscriberState::Subscribed);
                    info!("Subscribed to {}", self.topic_pattern);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        received_at: Utc::now(),
                    };
                    // Backpressure: wait for queue space, but never past shutdown
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        sent = self.queue.send(message) => {
                            if sent.is_err() {
                                warn!("Ingest worker gone; dropping message");
                            }
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    connected = false;
                    warn!("Broker sent DISCONNECT");
                    self.state.send_replace(SubscriberState::Disconnected);
                }
                Ok(event) => debug!("MQTT event: {:?}", event),
                Err(e) => {
                    connected = false;
                    failures += 1;
                    self.stats.record_reconnect();
                    self.state.send_replace(SubscriberState::Reconnecting);

                    if self.reconnect.exhausted(failures) {
                        error!("Giving up on MQTT broker after {} attempts: {}", failures, e);
                        let fault = IngestFault::BrokerUnreachable {
                            attempts: failures,
                            last_error: e.to_string(),
                        };
                        if self.faults.try_send(fault).is_err() {
                            warn!("Fault channel full or closed; fault not delivered");
                        }
                        self.state.send_replace(SubscriberState::Disconnected);
                        return;
                    }

                    let delay = self.reconnect.backoff(failures);
                    warn!(attempt = failures, ?delay, "MQTT connection error: {}", e);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if connected {
            self.disconnect(&mut eventloop).await;
        }
        self.state.send_replace(SubscriberState::Disconnected);
        info!("MQTT event loop stopped");
    }

    /// Unsubscribe and disconnect, polling just long enough to flush
    async fn disconnect(&self, eventloop: &mut EventLoop) {
        let _ = self.client.try_unsubscribe(self.topic_pattern.clone());
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request failed: {}", e);
            return;
        }

        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_FLUSH, flush).await.is_err() {
            debug!("Timed out flushing MQTT disconnect");
        }
    }
}
