//! ==============================================================================
//! domain.rs - telemetry entities shared by every stage of the relay
//! ==============================================================================
//!
//! purpose:
//!     the typed form of what the gateway sends us. raw json maps are turned
//!     into a `Reading` exactly once (classifier.rs); nothing downstream
//!     inspects untyped fields again.
//!
//! relationships:
//!     - built by: classifier.rs
//!     - sequenced by: history.rs
//!     - serialized by: server.rs (poll + push), sink.rs (upstream body)
//!
//! ==============================================================================

use chrono::{DateTime, Local};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// relay-side timestamp format used on the wire (local time)
pub const DATETIME_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// what a decoded record is, judged from its `type`/`kind` tag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    /// a sensor measurement (any non-reserved tag, or no tag at all)
    Measurement,
    GatewayStatus,
    GatewayBoot,
}

impl RecordKind {
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag {
            Some("gateway_status") => RecordKind::GatewayStatus,
            Some("gateway_boot") => RecordKind::GatewayBoot,
            _ => RecordKind::Measurement,
        }
    }

    pub fn is_control(self) -> bool {
        !matches!(self, RecordKind::Measurement)
    }
}

/// one accepted telemetry record
///
/// `sequence_id` is zero until the history buffer accepts the reading;
/// after insertion the reading lives behind an `Arc` and is never mutated.
#[derive(Clone, Debug)]
pub struct Reading {
    pub sequence_id: u64,
    /// hardware address of the node ("unknown" when absent)
    pub device_id: String,
    pub kind: RecordKind,
    /// raw `type` tag as sent (e.g. "distance")
    pub type_tag: String,
    /// raw value, hundredths of a centimetre for distance nodes
    pub measurement: f64,
    /// link quality in dBm, `None` when the node did not report it
    pub signal_strength: Option<i64>,
    /// seconds since the node booted
    pub device_uptime: u64,
    pub received_at: DateTime<Local>,
    /// the record exactly as decoded, forwarded upstream untouched
    pub fields: Map<String, Value>,
}

impl Reading {
    pub fn datetime(&self) -> String {
        self.received_at.format(DATETIME_FORMAT).to_string()
    }

    /// rssi for log lines, "-" when missing
    pub fn rssi_label(&self) -> String {
        self.signal_strength
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

// the wire shape is the node's own field mapping plus the relay's `id` and
// `datetime`; relay keys win over anything the node sent under those names
impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let passthrough = self
            .fields
            .iter()
            .filter(|(k, _)| k.as_str() != "id" && k.as_str() != "datetime");

        let mut map = serializer.serialize_map(None)?;
        for (key, value) in passthrough {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry("id", &self.sequence_id)?;
        map.serialize_entry("datetime", &self.datetime())?;
        map.end()
    }
}

/// serial link state as seen by the supervisor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct LinkStatus {
    pub serial: LinkState,
}

/// one frame on the push channel: `{"type": ..., "data": ...}`
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum PushMessage {
    /// replay sent once per subscriber, newest first
    History(Vec<Arc<Reading>>),
    Reading(Arc<Reading>),
    Status(LinkStatus),
}
