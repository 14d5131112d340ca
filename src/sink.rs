use crate::db::DatabaseService;
use crate::models::ReadingDocument;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;

/// Total insert attempts before a document is dropped.
pub const PERSIST_ATTEMPTS: usize = 3;
/// Fixed delay between attempts.
pub const PERSIST_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Durable store the adapter writes into. Implementations must be safe for
/// concurrent inserts from multiple broker pipelines.
pub trait ReadingStore: Send + Sync {
    fn insert_reading(&self, doc: &ReadingDocument) -> rusqlite::Result<()>;
}

impl ReadingStore for DatabaseService {
    fn insert_reading(&self, doc: &ReadingDocument) -> rusqlite::Result<()> {
        DatabaseService::insert_reading(self, doc)
    }
}

/// Persists documents with bounded retry. No deduplication and no
/// dead-letter queue: after the final attempt the document is dropped.
pub struct ReadingSinkAdapter<S: ReadingStore> {
    store: Arc<S>,
}

impl<S: ReadingStore> ReadingSinkAdapter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn persist(&self, doc: &ReadingDocument) -> bool {
        let strategy = FixedInterval::new(PERSIST_RETRY_DELAY).take(PERSIST_ATTEMPTS - 1);

        let result = Retry::spawn(strategy, || async {
            self.store.insert_reading(doc).map_err(|e| {
                warn!("Insert failed for sensor '{}': {e}", doc.sensor_id);
                e
            })
        })
        .await;

        match result {
            Ok(()) => {
                debug!("Inserted reading for sensor '{}'", doc.sensor_id);
                true
            }
            Err(e) => {
                error!(
                    "Dropping reading for sensor '{}' after {} attempts: {e}",
                    doc.sensor_id, PERSIST_ATTEMPTS
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelValue, Reading};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyStore {
        attempts: AtomicUsize,
        succeed_after: usize,
    }

    impl FlakyStore {
        fn failing() -> Self {
            Self {
                attempts: AtomicUsize::new(0),
                succeed_after: usize::MAX,
            }
        }

        fn succeeding_after(n: usize) -> Self {
            Self {
                attempts: AtomicUsize::new(0),
                succeed_after: n,
            }
        }
    }

    impl ReadingStore for FlakyStore {
        fn insert_reading(&self, _doc: &ReadingDocument) -> rusqlite::Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.succeed_after {
                Err(rusqlite::Error::ExecuteReturnedResults)
            } else {
                Ok(())
            }
        }
    }

    fn sample_doc() -> ReadingDocument {
        let mut readings = Reading::new();
        readings.insert(
            "temperature".to_string(),
            ChannelValue {
                value: 20.0,
                unit: "°C".to_string(),
            },
        );
        ReadingDocument {
            sensor_id: "Sensor_01".to_string(),
            readings,
            topic: "TEMP/SUB/Sensor_01".to_string(),
            timestamp: NaiveDate::from_ymd_opt(2025, 6, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            raw: "{}".to_string(),
            location: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_exactly_three_attempts() {
        let store = Arc::new(FlakyStore::failing());
        let sink = ReadingSinkAdapter::new(store.clone());

        assert!(!sink.persist(&sample_doc()).await);
        assert_eq!(store.attempts.load(Ordering::SeqCst), PERSIST_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_a_later_attempt() {
        let store = Arc::new(FlakyStore::succeeding_after(1));
        let sink = ReadingSinkAdapter::new(store.clone());

        assert!(sink.persist(&sample_doc()).await);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn first_attempt_success_does_not_wait() {
        let store = Arc::new(FlakyStore::succeeding_after(0));
        let sink = ReadingSinkAdapter::new(store.clone());

        assert!(sink.persist(&sample_doc()).await);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
    }
}
