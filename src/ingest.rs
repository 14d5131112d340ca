use crate::db::DatabaseService;
use crate::document::build_reading_document;
use crate::mqtt_connection::InboundMessage;
use crate::parser::parse_sensor_data;
use crate::sink::ReadingSinkAdapter;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Parse -> build -> persist stage behind every broker connection.
///
/// One shared pipeline serves all connections, but each connection gets its
/// own worker task and channel, so a slow insert for one broker never delays
/// message receipt on another. Every per-message failure is logged and
/// swallowed; nothing here may take down the supervisor.
pub struct IngestPipeline {
    db: Arc<DatabaseService>,
    sink: ReadingSinkAdapter<DatabaseService>,
}

impl IngestPipeline {
    pub fn new(db: Arc<DatabaseService>) -> Arc<Self> {
        let sink = ReadingSinkAdapter::new(db.clone());
        Arc::new(Self { db, sink })
    }

    /// Spawns the worker draining one connection's message channel.
    /// Messages are handled in arrival order.
    pub fn spawn_worker(self: &Arc<Self>, mut messages: mpsc::Receiver<InboundMessage>) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                pipeline.handle_message(message).await;
            }
        });
    }

    /// Processes one inbound message. Returns whether a document was persisted.
    pub async fn handle_message(&self, message: InboundMessage) -> bool {
        let topic = message.topic.trim();

        // The sensor id is conventionally the final topic segment; topics
        // shallower than prefix/group/sensor cannot carry one.
        if topic.matches('/').count() < 2 {
            warn!("Ignoring message on incomplete topic '{topic}'");
            return false;
        }

        debug!("[RECEIVED] {topic}: {}", message.payload);

        let Some(readings) = parse_sensor_data(&message.payload) else {
            warn!("Skipped insert: could not parse sensor data from topic {topic}");
            return false;
        };

        let sensor_id_hint = topic.rsplit('/').next().unwrap_or("unknown");

        let location = match self.db.metadata_for(sensor_id_hint.trim()) {
            Ok(location) => location,
            Err(e) => {
                warn!("Metadata lookup for '{sensor_id_hint}' failed: {e}");
                None
            }
        };

        let Some(document) = build_reading_document(
            sensor_id_hint,
            readings,
            &message.payload,
            topic,
            message.arrival,
            location,
        ) else {
            warn!("Skipped insert: invalid document for topic {topic}");
            return false;
        };

        self.sink.persist(&document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn pipeline() -> (Arc<IngestPipeline>, Arc<DatabaseService>) {
        let db = Arc::new(DatabaseService::new_in_memory().unwrap());
        db.initialize_db().unwrap();
        (IngestPipeline::new(db.clone()), db)
    }

    fn message(topic: &str, payload: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            arrival: Local::now().naive_local(),
        }
    }

    #[tokio::test]
    async fn persists_well_formed_message() {
        let (pipeline, db) = pipeline();

        let persisted = pipeline
            .handle_message(message("TEMP/SUB/Sensor_01", r#"{"T": "23.50 C", "H": "45.00 %"}"#))
            .await;

        assert!(persisted);
        let doc = db.get_latest_reading("Sensor_01").unwrap().unwrap();
        assert_eq!(doc.readings["temperature"].value, 23.5);
        assert_eq!(doc.readings["humidity"].unit, "%");
        assert_eq!(doc.topic, "TEMP/SUB/Sensor_01");
    }

    #[tokio::test]
    async fn malformed_message_does_not_poison_the_pipeline() {
        let (pipeline, db) = pipeline();

        assert!(!pipeline.handle_message(message("TEMP/SUB/Sensor_01", "garbage")).await);
        assert!(
            pipeline
                .handle_message(message("TEMP/SUB/Sensor_01", r#"{"T": "21.00 C"}"#))
                .await
        );
        assert!(
            pipeline
                .handle_message(message("FACTORY/LINE2/Sensor_02", "23.5,45.0"))
                .await
        );

        assert_eq!(db.count_readings().unwrap(), 2);
    }

    #[tokio::test]
    async fn incomplete_topic_is_ignored() {
        let (pipeline, db) = pipeline();

        assert!(!pipeline.handle_message(message("TEMP/orphan", r#"{"T": "21.00 C"}"#)).await);
        assert_eq!(db.count_readings().unwrap(), 0);
    }

    #[tokio::test]
    async fn reserved_sensor_id_from_topic_is_rejected() {
        let (pipeline, db) = pipeline();

        assert!(
            !pipeline
                .handle_message(message("TEMP/SUB/unknown", r#"{"T": "21.00 C"}"#))
                .await
        );
        assert_eq!(db.count_readings().unwrap(), 0);
    }

    #[tokio::test]
    async fn enriches_with_known_sensor_location() {
        let (pipeline, db) = pipeline();
        db.set_sensor_location("Sensor_01", &serde_json::json!({"room": "lab"}))
            .unwrap();

        pipeline
            .handle_message(message("TEMP/SUB/Sensor_01", r#"{"T": "23.50 C"}"#))
            .await;

        let doc = db.get_latest_reading("Sensor_01").unwrap().unwrap();
        assert_eq!(doc.location.unwrap()["room"], "lab");
    }
}
