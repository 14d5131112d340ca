use crate::document::TIMESTAMP_FORMAT;
use crate::models::{BrokerCredentials, ReadingDocument, SubscriptionRecord};
use chrono::NaiveDateTime;
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

pub struct DatabaseService {
    conn: Mutex<Connection>,
}

impl DatabaseService {
    /// Creates a new `DatabaseService` and ensures the database connection is valid.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().unwrap().execute_batch(sql)
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS subscriptions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            broker_url TEXT NOT NULL,
            topic_pattern TEXT NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT 1,
            username TEXT,
            password TEXT,
            UNIQUE (broker_url, topic_pattern)
        );

        CREATE TABLE IF NOT EXISTS sensors (
            sensor_id TEXT PRIMARY KEY,
            location TEXT
        );

        CREATE TABLE IF NOT EXISTS readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sensor_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            raw TEXT NOT NULL,
            readings TEXT NOT NULL,
            location TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_readings_sensor_ts
            ON readings (sensor_id ASC, timestamp DESC);
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e)
            }
        }
    }

    /// Adds or updates a subscription record.
    pub fn add_subscription(&self, record: &SubscriptionRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"
            INSERT INTO subscriptions (broker_url, topic_pattern, enabled, username, password)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(broker_url, topic_pattern) DO UPDATE SET
                enabled = excluded.enabled,
                username = excluded.username,
                password = excluded.password
            "#,
            params![
                record.broker_url,
                record.topic_pattern,
                record.enabled,
                record.username,
                record.password
            ],
        )?;
        Ok(())
    }

    /// Seeds a default subscription so a fresh deployment ingests immediately.
    /// No-op when the registry already has records.
    pub fn seed_default_subscription(&self, broker_url: &str, topic_pattern: &str) -> Result<()> {
        let count: i64 = {
            let conn = self.conn.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM subscriptions", [], |row| row.get(0))?
        };
        if count == 0 {
            info!("Registry is empty, seeding default subscription {broker_url} -> {topic_pattern}");
            self.add_subscription(&SubscriptionRecord {
                broker_url: broker_url.to_string(),
                topic_pattern: topic_pattern.to_string(),
                enabled: true,
                username: None,
                password: None,
            })?;
        }
        Ok(())
    }

    /// Point-in-time snapshot of the enabled registry rows, grouped by broker.
    /// Set semantics per broker: duplicate patterns collapse.
    pub fn list_enabled_subscriptions(&self) -> Result<HashMap<String, BTreeSet<String>>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare("SELECT broker_url, topic_pattern FROM subscriptions WHERE enabled = 1")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut mapping: HashMap<String, BTreeSet<String>> = HashMap::new();
        for row in rows {
            let (broker_url, topic_pattern) = row?;
            mapping.entry(broker_url).or_default().insert(topic_pattern);
        }

        Ok(mapping)
    }

    /// Credentials for a broker: the first registry row that carries a username.
    pub fn credentials_for(&self, broker_url: &str) -> Result<BrokerCredentials> {
        let conn = self.conn.lock().unwrap();

        let creds = conn
            .query_row(
                "SELECT username, password FROM subscriptions
                 WHERE broker_url = ?1 AND username IS NOT NULL
                 LIMIT 1",
                params![broker_url],
                |row| {
                    Ok(BrokerCredentials {
                        username: row.get(0)?,
                        password: row.get(1)?,
                    })
                },
            )
            .optional()?;

        Ok(creds.unwrap_or_default())
    }

    /// Adds or updates a sensor's location metadata.
    pub fn set_sensor_location(&self, sensor_id: &str, location: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"
            INSERT INTO sensors (sensor_id, location)
            VALUES (?1, ?2)
            ON CONFLICT(sensor_id) DO UPDATE SET location = excluded.location
            "#,
            params![sensor_id, location.to_string()],
        )?;
        Ok(())
    }

    /// Best-effort location lookup for document enrichment.
    pub fn metadata_for(&self, sensor_id: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();

        let location: Option<String> = conn
            .query_row(
                "SELECT location FROM sensors WHERE sensor_id = ?1",
                params![sensor_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(location.and_then(|text| serde_json::from_str(&text).ok()))
    }

    /// Inserts a reading document. No deduplication: redelivered messages
    /// produce duplicate rows (at-least-once persistence).
    pub fn insert_reading(&self, doc: &ReadingDocument) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let readings_json = serde_json::to_string(&doc.readings)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let location_json = doc.location.as_ref().map(|l| l.to_string());

        conn.execute(
            r#"
            INSERT INTO readings (sensor_id, topic, timestamp, raw, readings, location)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                doc.sensor_id,
                doc.topic,
                doc.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                doc.raw,
                readings_json,
                location_json
            ],
        )?;
        Ok(())
    }

    /// Retrieves the newest reading for a sensor via the secondary index.
    pub fn get_latest_reading(&self, sensor_id: &str) -> Result<Option<ReadingDocument>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            "SELECT sensor_id, topic, timestamp, raw, readings, location
             FROM readings
             WHERE sensor_id = ?1
             ORDER BY timestamp DESC
             LIMIT 1",
            params![sensor_id],
            row_to_document,
        )
        .optional()
    }

    /// Retrieves readings for a sensor, newest first, optionally bounded by
    /// an inclusive timestamp range.
    pub fn get_readings(
        &self,
        sensor_id: &str,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
        limit: usize,
    ) -> Result<Vec<ReadingDocument>> {
        let conn = self.conn.lock().unwrap();

        let start = start
            .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_else(|| "0000-00-00 00:00:00".to_string());
        let end = end
            .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_else(|| "9999-99-99 99:99:99".to_string());

        let mut stmt = conn.prepare(
            "SELECT sensor_id, topic, timestamp, raw, readings, location
             FROM readings
             WHERE sensor_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![sensor_id, start, end, limit], row_to_document)?;

        rows.collect()
    }

    /// Retrieves the newest readings across all sensors.
    pub fn get_recent_readings(&self, limit: usize) -> Result<Vec<ReadingDocument>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT sensor_id, topic, timestamp, raw, readings, location
             FROM readings
             ORDER BY timestamp DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_document)?;

        rows.collect()
    }

    pub fn count_readings(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))
    }
}

fn row_to_document(row: &Row<'_>) -> Result<ReadingDocument> {
    let timestamp_text: String = row.get(2)?;
    let readings_json: String = row.get(4)?;
    let location_json: Option<String> = row.get(5)?;

    let timestamp = NaiveDateTime::parse_from_str(&timestamp_text, TIMESTAMP_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e)))?;
    let readings = serde_json::from_str(&readings_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(ReadingDocument {
        sensor_id: row.get(0)?,
        topic: row.get(1)?,
        timestamp,
        raw: row.get(3)?,
        readings,
        location: location_json.and_then(|text| serde_json::from_str(&text).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelValue;
    use chrono::NaiveDate;

    fn service() -> DatabaseService {
        let db = DatabaseService::new_in_memory().unwrap();
        db.initialize_db().unwrap();
        db
    }

    fn sample_doc(sensor_id: &str, hour: u32) -> ReadingDocument {
        let mut readings = crate::models::Reading::new();
        readings.insert(
            "temperature".to_string(),
            ChannelValue {
                value: 21.5,
                unit: "°C".to_string(),
            },
        );
        ReadingDocument {
            sensor_id: sensor_id.to_string(),
            readings,
            topic: format!("TEMP/SUB/{sensor_id}"),
            timestamp: NaiveDate::from_ymd_opt(2025, 6, 1)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
            raw: r#"{"T": "21.50 C"}"#.to_string(),
            location: None,
        }
    }

    #[test]
    fn subscriptions_group_by_broker_with_set_semantics() {
        let db = service();
        for (broker, topic, enabled) in [
            ("mqtt://a", "TEMP/SUB/#", true),
            ("mqtt://a", "VITALS/+/hr", true),
            ("mqtt://a", "TEMP/SUB/#", true), // duplicate collapses
            ("mqtt://b", "FACTORY/#", true),
            ("mqtt://b", "DISABLED/#", false),
        ] {
            db.add_subscription(&SubscriptionRecord {
                broker_url: broker.to_string(),
                topic_pattern: topic.to_string(),
                enabled,
                username: None,
                password: None,
            })
            .unwrap();
        }

        let mapping = db.list_enabled_subscriptions().unwrap();
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping["mqtt://a"].len(), 2);
        assert_eq!(
            mapping["mqtt://b"].iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["FACTORY/#"]
        );
    }

    #[test]
    fn credentials_round_trip() {
        let db = service();
        db.add_subscription(&SubscriptionRecord {
            broker_url: "mqtt://secure".to_string(),
            topic_pattern: "TEMP/SUB/#".to_string(),
            enabled: true,
            username: Some("emqx".to_string()),
            password: Some("public".to_string()),
        })
        .unwrap();

        let creds = db.credentials_for("mqtt://secure").unwrap();
        assert_eq!(creds.username.as_deref(), Some("emqx"));
        assert_eq!(creds.password.as_deref(), Some("public"));

        let none = db.credentials_for("mqtt://anon").unwrap();
        assert!(none.username.is_none());
    }

    #[test]
    fn seed_only_when_registry_empty() {
        let db = service();
        db.seed_default_subscription("broker.emqx.io", "TEMP/SUB/#")
            .unwrap();
        db.seed_default_subscription("other.example", "OTHER/#")
            .unwrap();

        let mapping = db.list_enabled_subscriptions().unwrap();
        assert_eq!(mapping.len(), 1);
        assert!(mapping.contains_key("broker.emqx.io"));
    }

    #[test]
    fn insert_and_query_latest() {
        let db = service();
        db.insert_reading(&sample_doc("Sensor_01", 8)).unwrap();
        db.insert_reading(&sample_doc("Sensor_01", 12)).unwrap();
        db.insert_reading(&sample_doc("Sensor_02", 10)).unwrap();

        let latest = db.get_latest_reading("Sensor_01").unwrap().unwrap();
        assert_eq!(latest.timestamp.format("%H").to_string(), "12");
        assert_eq!(latest.readings["temperature"].value, 21.5);

        assert!(db.get_latest_reading("Sensor_99").unwrap().is_none());
        assert_eq!(db.count_readings().unwrap(), 3);
    }

    #[test]
    fn range_query_is_inclusive_and_newest_first() {
        let db = service();
        for hour in [6, 9, 12, 15] {
            db.insert_reading(&sample_doc("Sensor_01", hour)).unwrap();
        }

        let start = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0);
        let end = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0);

        let docs = db.get_readings("Sensor_01", start, end, 100).unwrap();
        let hours: Vec<String> = docs
            .iter()
            .map(|d| d.timestamp.format("%H").to_string())
            .collect();
        assert_eq!(hours, vec!["12", "09"]);
    }

    #[test]
    fn metadata_lookup_enrichment() {
        let db = service();
        db.set_sensor_location("Sensor_01", &serde_json::json!({"room": "lab"}))
            .unwrap();

        let location = db.metadata_for("Sensor_01").unwrap().unwrap();
        assert_eq!(location["room"], "lab");
        assert!(db.metadata_for("Sensor_02").unwrap().is_none());
    }
}
