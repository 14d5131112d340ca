use crate::models::{Reading, ReadingDocument};
use chrono::NaiveDateTime;
use log::warn;
use serde_json::Value;

/// Generic ids that leak out of topic prefixes; never valid sensor ids.
const RESERVED_SENSOR_IDS: [&str; 3] = ["temp", "sub", "unknown"];

/// Wire format used by the devices and the readings table.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Combine a parsed reading with its topic, arrival time and optional
/// location metadata into a persistable document.
///
/// Returns `None` when the sensor id hint is invalid or the reading carries
/// no usable value; a device-reported timestamp in the payload wins over the
/// arrival time, falling back on any parse failure.
pub fn build_reading_document(
    sensor_id_hint: &str,
    readings: Reading,
    raw: &str,
    topic: &str,
    arrival: NaiveDateTime,
    location: Option<Value>,
) -> Option<ReadingDocument> {
    let sensor_id = sensor_id_hint.trim();
    if !is_valid_sensor_id(sensor_id) {
        warn!("Invalid or generic sensor_id '{sensor_id}' from topic '{topic}'. Skipping.");
        return None;
    }

    if readings.is_empty() || !readings.values().any(|c| c.value.is_finite()) {
        warn!("Invalid reading: {readings:?}, topic={topic}, message={raw}");
        return None;
    }

    let timestamp = device_timestamp(raw).unwrap_or(arrival);

    Some(ReadingDocument {
        sensor_id: sensor_id.to_string(),
        readings,
        topic: topic.to_string(),
        timestamp,
        raw: raw.to_string(),
        location,
    })
}

fn is_valid_sensor_id(sensor_id: &str) -> bool {
    !sensor_id.is_empty()
        && sensor_id.chars().all(|c| c.is_alphanumeric() || c == '_')
        && !RESERVED_SENSOR_IDS.contains(&sensor_id.to_lowercase().as_str())
}

/// Devices may report their own clock under a handful of key spellings.
fn device_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let payload: Value = serde_json::from_str(raw).ok()?;
    let field = payload
        .get("date time")
        .or_else(|| payload.get("datetime"))
        .or_else(|| payload.get("timestamp"))?
        .as_str()?;

    NaiveDateTime::parse_from_str(field, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(field, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}
