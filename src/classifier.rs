//! ==============================================================================
//! classifier.rs - control message filter and typed decode
//! ==============================================================================
//!
//! purpose:
//!     the gateway reports its own boot and periodic status on the same line
//!     protocol as node telemetry. those are observed here and dropped; every
//!     other record becomes a `Reading`.
//!
//! field mapping (gateway json -> Reading):
//!     mac | device_id   -> device_id        (default "unknown")
//!     type | kind       -> kind / type_tag  (default "unknown")
//!     value             -> measurement      (default 0)
//!     rssi              -> signal_strength  (default none, logged as "-")
//!     uptime            -> device_uptime    (default 0)
//!
//!     missing or mistyped optional fields never reject a record.
//!
//! ==============================================================================

use crate::domain::{Reading, RecordKind};
use chrono::{DateTime, Local};
use serde_json::{Map, Value};

#[derive(Debug)]
pub enum Classified {
    Reading(Reading),
    /// gateway chatter, never relayed
    Control(RecordKind),
}

pub fn classify(record: Map<String, Value>, received_at: DateTime<Local>) -> Classified {
    let tag = str_field(&record, &["type", "kind"]);
    let kind = RecordKind::from_tag(tag);

    if kind.is_control() {
        let record = Value::Object(record);
        tracing::debug!("Gateway control message ({:?}): {}", kind, record);
        return Classified::Control(kind);
    }

    let type_tag = tag.unwrap_or("unknown").to_string();
    let device_id = str_field(&record, &["mac", "device_id"])
        .unwrap_or("unknown")
        .to_string();
    let measurement = record.get("value").and_then(Value::as_f64).unwrap_or(0.0);
    let signal_strength = record.get("rssi").and_then(as_signed);
    let device_uptime = record.get("uptime").and_then(as_unsigned).unwrap_or(0);

    Classified::Reading(Reading {
        sequence_id: 0,
        device_id,
        kind,
        type_tag,
        measurement,
        signal_strength,
        device_uptime,
        received_at,
        fields: record,
    })
}

/// first key present with a string value
fn str_field<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| record.get(*k).and_then(Value::as_str))
}

fn as_signed(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64))
}

fn as_unsigned(v: &Value) -> Option<u64> {
    v.as_u64()
        .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}
