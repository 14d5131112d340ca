use crate::models::BrokerCredentials;
use chrono::{Local, NaiveDateTime};
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionLifecycle {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection to '{0}' is stopped")]
    Stopped(String),
}

/// One inbound publish, as handed to the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    pub arrival: NaiveDateTime,
}

/// Owns one physical connection to one broker.
///
/// Lifecycle: `Disconnected -> Connecting -> Connected`, back to
/// `Disconnected` on an unsolicited drop (followed by autonomous reconnection
/// with backoff and the last-known topic set), and terminally `Stopped` only
/// via [`BrokerConnection::stop`]. Received publishes are forwarded over the
/// connection's own channel so a slow pipeline never blocks other brokers.
pub struct BrokerConnection {
    pub broker_url: String,
    credentials: BrokerCredentials,
    state: Mutex<ConnectionLifecycle>,
    client: Mutex<Option<AsyncClient>>,
    topics: Mutex<BTreeSet<String>>,
    messages: mpsc::Sender<InboundMessage>,
    stop_tx: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
}

impl BrokerConnection {
    pub fn new(
        broker_url: &str,
        initial_topics: BTreeSet<String>,
        credentials: BrokerCredentials,
        messages: mpsc::Sender<InboundMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            broker_url: broker_url.to_string(),
            credentials,
            state: Mutex::new(ConnectionLifecycle::Disconnected),
            client: Mutex::new(None),
            topics: Mutex::new(initial_topics),
            messages,
            stop_tx,
            shutdown,
        })
    }

    /// Begins the asynchronous connect/receive loop in its own task.
    pub fn start(self: &Arc<Self>) {
        let connection = self.clone();
        tokio::spawn(async move {
            connection.run_event_loop().await;
        });
    }

    /// Current lifecycle state.
    pub async fn lifecycle(&self) -> ConnectionLifecycle {
        self.state.lock().await.clone()
    }

    /// Snapshot of the subscribed topic set.
    pub async fn subscribed_topics(&self) -> BTreeSet<String> {
        self.topics.lock().await.clone()
    }

    /// Subscribes to any topics not already covered; already-subscribed
    /// topics are skipped. Returns how many new subscriptions were issued.
    pub async fn add_topics(&self, topics: &BTreeSet<String>) -> Result<usize, ConnectionError> {
        if *self.state.lock().await == ConnectionLifecycle::Stopped {
            return Err(ConnectionError::Stopped(self.broker_url.clone()));
        }

        let mut subscribed = self.topics.lock().await;
        let client = self.client.lock().await;
        let mut added = 0;

        for topic in topics {
            if subscribed.contains(topic) {
                continue;
            }
            // Record the topic even when the subscribe request cannot be
            // issued right now; the reconnect path resubscribes the full set.
            subscribed.insert(topic.clone());
            added += 1;
            if let Some(client) = client.as_ref() {
                if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                    warn!("[{}] Subscribe request for '{topic}' failed: {e}", self.broker_url);
                } else {
                    info!("[{}] Subscribed to '{topic}'", self.broker_url);
                }
            }
        }

        Ok(added)
    }

    /// Supervisor-initiated teardown: disconnect, release the client and
    /// transition to the terminal `Stopped` state.
    pub async fn stop(&self) -> Result<(), ConnectionError> {
        {
            let mut state = self.state.lock().await;
            if *state == ConnectionLifecycle::Stopped {
                return Err(ConnectionError::Stopped(self.broker_url.clone()));
            }
            *state = ConnectionLifecycle::Stopped;
        }

        let _ = self.stop_tx.send(true);

        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.disconnect().await {
                debug!("[{}] Disconnect on stop failed: {e}", self.broker_url);
            }
        }

        info!("[{}] Connection stopped.", self.broker_url);
        Ok(())
    }

    async fn run_event_loop(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut shutdown = self.shutdown.clone();
        let mut retry_interval = INITIAL_RECONNECT_DELAY;

        loop {
            if *stop_rx.borrow() || *shutdown.borrow() {
                break;
            }

            {
                let mut state = self.state.lock().await;
                if *state == ConnectionLifecycle::Stopped {
                    break;
                }
                *state = ConnectionLifecycle::Connecting;
            }

            let (host, port) = split_host_port(&self.broker_url);
            debug!("Configuring MQTT broker at {host}:{port}...");

            let client_id = format!("sensorflux_{}", Uuid::new_v4());
            let mut mqtt_options = MqttOptions::new(client_id, host, port);
            mqtt_options.set_keep_alive(Duration::from_secs(10));
            mqtt_options.set_clean_session(true);

            if let Some(username) = &self.credentials.username {
                mqtt_options.set_credentials(
                    username,
                    self.credentials.password.as_deref().unwrap_or(""),
                );
            }

            // Queue subscriptions for the full last-known topic set; rumqttc
            // flushes them once the connection comes up. The request channel
            // must hold them all before the first poll.
            let topics = self.topics.lock().await.clone();
            let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10.max(topics.len() + 1));
            for topic in &topics {
                if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                    error!("[{}] Failed to queue subscribe for '{topic}': {e}", self.broker_url);
                }
            }

            {
                let mut client_lock = self.client.lock().await;
                *client_lock = Some(client);
            }

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        debug!("[{}] Stop signal received.", self.broker_url);
                        if let Some(client) = self.client.lock().await.take() {
                            let _ = client.disconnect().await;
                        }
                        return;
                    }
                    _ = shutdown.changed() => {
                        info!("[{}] Shutdown signal received, disconnecting.", self.broker_url);
                        if let Some(client) = self.client.lock().await.take() {
                            let _ = client.disconnect().await;
                        }
                        return;
                    }
                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                info!("[{}] Connected.", self.broker_url);
                                let mut state = self.state.lock().await;
                                *state = ConnectionLifecycle::Connected;
                                retry_interval = INITIAL_RECONNECT_DELAY;
                            }
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                let message = InboundMessage {
                                    topic: publish.topic.clone(),
                                    payload: String::from_utf8_lossy(&publish.payload).to_string(),
                                    arrival: Local::now().naive_local(),
                                };
                                if self.messages.send(message).await.is_err() {
                                    warn!("[{}] Pipeline channel closed, dropping message.", self.broker_url);
                                }
                            }
                            Ok(event) => {
                                debug!("[{}] Unhandled event: {event:?}", self.broker_url);
                            }
                            Err(e) => {
                                error!("[{}] Error in MQTT event loop: {e:?}", self.broker_url);
                                let mut state = self.state.lock().await;
                                *state = ConnectionLifecycle::Disconnected;
                                break;
                            }
                        }
                    }
                }
            }

            warn!(
                "[{}] Lost connection. Retrying in {:?}...",
                self.broker_url, retry_interval
            );
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = shutdown.changed() => return,
                _ = sleep(retry_interval) => {}
            }
            retry_interval = (retry_interval * 2).min(MAX_RECONNECT_DELAY);
        }
    }
}

/// Broker urls come in as `mqtt://host:port`, `host:port`, a bare host, or a
/// bracketed IPv6 literal; the port defaults to 1883.
fn split_host_port(broker_url: &str) -> (String, u16) {
    let stripped = broker_url
        .strip_prefix("mqtt://")
        .or_else(|| broker_url.strip_prefix("tcp://"))
        .unwrap_or(broker_url);

    if let Some(rest) = stripped.strip_prefix('[') {
        if let Some((host, suffix)) = rest.split_once(']') {
            let port = match suffix.strip_prefix(':') {
                Some(port) => parse_port(port, broker_url),
                None => 1883,
            };
            return (host.to_string(), port);
        }
    }

    match stripped.rsplit_once(':') {
        // A host part still holding a colon is an unbracketed IPv6 literal,
        // not a host:port split.
        Some((host, _)) if host.contains(':') => (stripped.to_string(), 1883),
        Some((host, port)) => (host.to_string(), parse_port(port, broker_url)),
        None => (stripped.to_string(), 1883),
    }
}

fn parse_port(port: &str, broker_url: &str) -> u16 {
    port.parse().unwrap_or_else(|_| {
        warn!("Invalid port '{port}' in broker url '{broker_url}', falling back to 1883");
        1883
    })
}
