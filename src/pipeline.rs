//! ==============================================================================
//! pipeline.rs - what happens to one serial line
//! ==============================================================================
//!
//! purpose:
//!     the single producer of the relay. for every line the supervisor hands
//!     over, in order:
//!
//!         decode ─> classify ─┬─ control:  debug log, counted, dropped
//!                             └─ reading:  history.insert   (assigns id)
//!                                          dispatcher.publish
//!                                          sink.offer       (never waits)
//!
//!     a reading is fully fanned out before the next line is looked at, so
//!     subscribers see readings in acceptance order.
//!
//! relationships:
//!     - driven by: supervisor.rs (LinkHandler)
//!     - writes: history.rs, dispatcher.rs, sink.rs
//!     - counters read by: server.rs (/api/stats), main.rs (final summary)
//!
//! ==============================================================================

use crate::classifier::{classify, Classified};
use crate::decoder::{decode_line, truncate_for_log, Decoded};
use crate::dispatcher::Dispatcher;
use crate::domain::{LinkState, Reading, RecordKind, DATETIME_FORMAT};
use crate::history::HistoryBuffer;
use crate::sink::SinkHandle;
use crate::supervisor::LinkHandler;
use chrono::{Local, TimeZone};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// characters of a bad line kept in the warning
const LOG_SNIPPET_CHARS: usize = 50;

// ==============================================================================
// relay counters
// ==============================================================================

#[derive(Debug, Default)]
pub struct RelayStats {
    records_received: AtomicU64,
    readings_accepted: AtomicU64,
    control_messages: AtomicU64,
    malformed_lines: AtomicU64,
    /// unix ms of the last accepted reading, 0 = never
    last_reading_ms: AtomicI64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RelaySnapshot {
    pub records_received: u64,
    pub readings_accepted: u64,
    pub control_messages: u64,
    pub malformed_lines: u64,
    pub last_reading_at: Option<String>,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelaySnapshot {
        let last_ms = self.last_reading_ms.load(Ordering::Relaxed);
        let last_reading_at = (last_ms > 0)
            .then(|| Local.timestamp_millis_opt(last_ms).single())
            .flatten()
            .map(|t| t.format(DATETIME_FORMAT).to_string());

        RelaySnapshot {
            records_received: self.records_received.load(Ordering::Relaxed),
            readings_accepted: self.readings_accepted.load(Ordering::Relaxed),
            control_messages: self.control_messages.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            last_reading_at,
        }
    }
}

// ==============================================================================
// pipeline
// ==============================================================================

/// what became of one line
#[derive(Debug)]
pub enum Ingested {
    Accepted(Arc<Reading>),
    Control(RecordKind),
    Ignored,
    Malformed,
}

pub struct Pipeline {
    history: Arc<HistoryBuffer>,
    dispatcher: Dispatcher,
    sink: Option<SinkHandle>,
    stats: Arc<RelayStats>,
    show_readings: bool,
}

impl Pipeline {
    pub fn new(
        history: Arc<HistoryBuffer>,
        dispatcher: Dispatcher,
        sink: Option<SinkHandle>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            history,
            dispatcher,
            sink,
            stats,
            show_readings: true,
        }
    }

    /// log every reading accepted through `on_line` at info (default on)
    pub fn show_readings(mut self, show: bool) -> Self {
        self.show_readings = show;
        self
    }

    pub fn ingest_line(&mut self, line: &str) -> Ingested {
        let record = match decode_line(line) {
            Decoded::Record(record) => record,
            Decoded::Ignored => return Ingested::Ignored,
            Decoded::Malformed(e) => {
                tracing::warn!(
                    "Invalid JSON: {} ({})",
                    truncate_for_log(line.trim(), LOG_SNIPPET_CHARS),
                    e
                );
                self.stats.malformed_lines.fetch_add(1, Ordering::Relaxed);
                return Ingested::Malformed;
            }
        };
        self.stats.records_received.fetch_add(1, Ordering::Relaxed);

        let reading = match classify(record, Local::now()) {
            Classified::Reading(reading) => reading,
            Classified::Control(kind) => {
                self.stats.control_messages.fetch_add(1, Ordering::Relaxed);
                return Ingested::Control(kind);
            }
        };

        let reading = self.history.insert(reading);
        self.stats.readings_accepted.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_reading_ms
            .store(reading.received_at.timestamp_millis(), Ordering::Relaxed);

        self.dispatcher.publish(&reading);
        if let Some(sink) = &self.sink {
            // a refused offer is counted and logged by the handle
            let _ = sink.offer(reading.clone());
        }

        Ingested::Accepted(reading)
    }
}

impl LinkHandler for Pipeline {
    fn on_line(&mut self, line: &str) {
        match self.ingest_line(line) {
            Ingested::Accepted(reading) if self.show_readings => {
                tracing::info!(
                    "RX: [{}] {} | {}={} | RSSI={} | up={}s",
                    reading.sequence_id,
                    reading.device_id,
                    reading.type_tag,
                    reading.measurement,
                    reading.rssi_label(),
                    reading.device_uptime
                );
            }
            Ingested::Control(RecordKind::GatewayBoot) => {
                tracing::info!("Gateway reported a boot");
            }
            _ => {}
        }
    }

    fn on_link_state(&mut self, state: LinkState) {
        self.dispatcher.set_link_state(state);
    }
}
