use crate::models::{ChannelValue, Reading};
use log::warn;
use serde_json::{Map, Value};

const TEMPERATURE_ALIASES: [&str; 3] = ["temp", "t", "temperature"];
const HUMIDITY_ALIASES: [&str; 3] = ["hum", "h", "humidity"];
const ACCEL_AXES: [&str; 3] = ["x", "y", "z"];

/// Parse a raw sensor payload into canonical channel readings.
///
/// JSON object payloads are inspected for known key aliases; anything else
/// falls back to positional numeric-token extraction (legacy devices publish
/// bare `"23.5,45.0"` strings). Returns `None` when no channel could be
/// extracted, never an empty map. Pure function.
pub fn parse_sensor_data(raw: &str) -> Option<Reading> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => parse_json_object(&map),
        _ => parse_numeric_fallback(trimmed),
    }
}

fn parse_json_object(map: &Map<String, Value>) -> Option<Reading> {
    let normalized: Map<String, Value> = map
        .iter()
        .map(|(k, v)| (k.trim().to_lowercase(), v.clone()))
        .collect();

    let mut readings = Reading::new();

    // First matching alias wins per channel.
    for key in TEMPERATURE_ALIASES {
        if let Some(value) = normalized.get(key) {
            insert_channel(&mut readings, "temperature", value, "°C");
            break;
        }
    }
    for key in HUMIDITY_ALIASES {
        if let Some(value) = normalized.get(key) {
            insert_channel(&mut readings, "humidity", value, "%");
            break;
        }
    }
    if let Some(value) = normalized.get("bpm") {
        insert_channel(&mut readings, "bpm", value, "bpm");
    }
    if let Some(value) = normalized.get("spo2") {
        insert_channel(&mut readings, "spo2", value, "%");
    }

    // Accelerometer axes may be flat or nested under a `vibration` object.
    for axis in ACCEL_AXES {
        if let Some(value) = normalized.get(axis) {
            insert_channel(&mut readings, axis, value, "g");
        } else if let Some(Value::Object(vibration)) = normalized.get("vibration") {
            if let Some(value) = vibration.get(axis) {
                insert_channel(&mut readings, axis, value, "g");
            }
        }
    }

    if readings.is_empty() {
        None
    } else {
        Some(readings)
    }
}

/// A failed extraction skips the channel; it never aborts the others.
fn insert_channel(readings: &mut Reading, channel: &str, value: &Value, default_unit: &str) {
    match extract_numeric(value) {
        Some((value, unit)) => {
            readings.insert(
                channel.to_string(),
                ChannelValue {
                    value,
                    unit: unit.unwrap_or_else(|| default_unit.to_string()),
                },
            );
        }
        None => {
            warn!("Could not extract numeric value for channel '{channel}' from {value}");
        }
    }
}

/// Pull a number out of a JSON value. String values like `"23.5 C"` yield
/// the leading numeric token plus the trailing token as unit.
fn extract_numeric(value: &Value) -> Option<(f64, Option<String>)> {
    match value {
        Value::Number(n) => n.as_f64().map(|v| (v, None)),
        Value::String(s) => {
            let mut parts = s.split_whitespace();
            let number: f64 = parts.next()?.parse().ok()?;
            let unit = parts.next_back().map(str::to_string);
            Some((number, unit))
        }
        _ => None,
    }
}

/// Heuristic degrade path for non-JSON payloads: the first two numeric
/// tokens are assigned positionally to temperature then humidity.
fn parse_numeric_fallback(text: &str) -> Option<Reading> {
    let numbers = numeric_tokens(text);
    let mut readings = Reading::new();

    if let Some(&temperature) = numbers.first() {
        readings.insert(
            "temperature".to_string(),
            ChannelValue {
                value: temperature,
                unit: "°C".to_string(),
            },
        );
    }
    if let Some(&humidity) = numbers.get(1) {
        readings.insert(
            "humidity".to_string(),
            ChannelValue {
                value: humidity,
                unit: "%".to_string(),
            },
        );
    }

    if readings.is_empty() {
        warn!("No numeric tokens found in non-JSON payload");
        None
    } else {
        Some(readings)
    }
}

/// Scan free text for float/integer tokens, tolerating arbitrary separators.
fn numeric_tokens(text: &str) -> Vec<f64> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        if c.is_ascii_digit() || c == '.' || ((c == '-' || c == '+') && current.is_empty()) {
            current.push(c);
        } else if !current.is_empty() {
            if let Ok(n) = current.parse::<f64>() {
                tokens.push(n);
            }
            current.clear();
        }
    }
    if let Ok(n) = current.parse::<f64>() {
        tokens.push(n);
    }

    tokens
}
