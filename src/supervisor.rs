use crate::db::DatabaseService;
use crate::ingest::IngestPipeline;
use crate::mqtt_connection::BrokerConnection;
use log::{error, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, Duration};

/// Per-connection buffer between the receive loop and its pipeline worker.
const MESSAGE_BUFFER: usize = 64;

/// Registry snapshot: broker url -> desired topic patterns. Rebuilt fresh
/// every refresh cycle, never mutated in place.
pub type DesiredState = HashMap<String, BTreeSet<String>>;

/// Reconciles the subscription registry against the running broker
/// connections on a fixed interval.
///
/// After every cycle the connection map keys equal the desired broker set;
/// per-connection topic sets only ever grow (topic removal is not supported,
/// a documented limitation inherited from the registry design).
pub struct Supervisor {
    db: Arc<DatabaseService>,
    pipeline: Arc<IngestPipeline>,
    connections: Mutex<HashMap<String, Arc<BrokerConnection>>>,
    refresh_interval: Duration,
    registry_retry: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(
        db: Arc<DatabaseService>,
        pipeline: Arc<IngestPipeline>,
        refresh_interval: Duration,
        registry_retry: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            pipeline,
            connections: Mutex::new(HashMap::new()),
            refresh_interval,
            registry_retry,
            shutdown,
        })
    }

    /// The reconciliation loop. Runs until the shutdown signal flips, then
    /// stops every remaining connection.
    pub async fn run(self: Arc<Self>) {
        info!(
            "Subscription supervisor started (refresh every {:?}).",
            self.refresh_interval
        );
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let desired = match self.db.list_enabled_subscriptions() {
                Ok(desired) => desired,
                Err(e) => {
                    // Transient registry failure: existing connections stay up.
                    error!("Failed to fetch subscription registry: {e}");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(self.registry_retry) => {}
                    }
                    continue;
                }
            };

            self.reconcile(&desired).await;

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(self.refresh_interval) => {}
            }
        }

        self.stop_all().await;
        info!("Subscription supervisor stopped.");
    }

    /// One reconciliation cycle against a desired-state snapshot: create
    /// connections for new brokers, extend existing ones, tear down brokers
    /// that disappeared entirely.
    pub async fn reconcile(&self, desired: &DesiredState) {
        let mut connections = self.connections.lock().await;

        for (broker_url, desired_topics) in desired {
            match connections.get(broker_url) {
                None => {
                    let credentials = match self.db.credentials_for(broker_url) {
                        Ok(credentials) => credentials,
                        Err(e) => {
                            warn!("Credential lookup for '{broker_url}' failed, connecting anonymously: {e}");
                            Default::default()
                        }
                    };

                    info!(
                        "New broker '{broker_url}' with {} topic(s), starting connection.",
                        desired_topics.len()
                    );
                    let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
                    let connection = BrokerConnection::new(
                        broker_url,
                        desired_topics.clone(),
                        credentials,
                        tx,
                        self.shutdown.clone(),
                    );
                    connection.start();
                    self.pipeline.spawn_worker(rx);
                    connections.insert(broker_url.clone(), connection);
                }
                Some(connection) => {
                    let subscribed = connection.subscribed_topics().await;
                    let extra: BTreeSet<String> =
                        desired_topics.difference(&subscribed).cloned().collect();
                    if extra.is_empty() {
                        continue;
                    }
                    match connection.add_topics(&extra).await {
                        Ok(added) => {
                            info!("Extended '{broker_url}' with {added} topic(s).");
                        }
                        Err(e) => {
                            warn!("Could not extend '{broker_url}': {e}");
                        }
                    }
                }
            }
        }

        let stale: Vec<String> = connections
            .keys()
            .filter(|broker_url| !desired.contains_key(*broker_url))
            .cloned()
            .collect();
        for broker_url in stale {
            if let Some(connection) = connections.remove(&broker_url) {
                info!("Broker '{broker_url}' left the registry, stopping connection.");
                if let Err(e) = connection.stop().await {
                    warn!("Stopping '{broker_url}' failed: {e}");
                }
            }
        }
    }

    /// Brokers with a live connection right now.
    pub async fn connected_brokers(&self) -> BTreeSet<String> {
        self.connections.lock().await.keys().cloned().collect()
    }

    /// Handle to one running connection, if any.
    pub async fn connection(&self, broker_url: &str) -> Option<Arc<BrokerConnection>> {
        self.connections.lock().await.get(broker_url).cloned()
    }

    async fn stop_all(&self) {
        let mut connections = self.connections.lock().await;
        for (broker_url, connection) in connections.drain() {
            if let Err(e) = connection.stop().await {
                warn!("Stopping '{broker_url}' on shutdown failed: {e}");
            }
        }
    }
}
