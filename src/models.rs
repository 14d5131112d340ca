use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row of the subscription registry.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub broker_url: String,
    pub topic_pattern: String,
    pub enabled: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BrokerCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// A single measured channel: numeric value plus unit string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelValue {
    pub value: f64,
    pub unit: String,
}

/// Canonical parsed measurement, keyed by channel name (temperature,
/// humidity, bpm, spo2, x/y/z). Never empty: the parser returns `None`
/// instead of an empty map.
pub type Reading = BTreeMap<String, ChannelValue>;

/// A fully validated reading, ready for the sink. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingDocument {
    pub sensor_id: String,
    pub readings: Reading,
    pub topic: String,
    pub timestamp: NaiveDateTime,
    pub raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<serde_json::Value>,
}
