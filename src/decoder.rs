//! ==============================================================================
//! decoder.rs - serial bytes to json records
//! ==============================================================================
//!
//! purpose:
//!     the gateway prints one json object per line over usb, interleaved with
//!     esp-idf boot noise and log text. this module cuts the byte stream into
//!     lines and keeps only the ones that parse as json objects.
//!
//! rules:
//!     - a line is a candidate only if, trimmed, it starts with '{'
//!     - anything else is ignored silently (log text, blank lines)
//!     - a candidate that fails to parse is "malformed" (caller warns)
//!     - no reassembly across lines: one line, one record
//!
//! relationships:
//!     - fed by: supervisor.rs (raw chunks from the serial port)
//!     - feeds: pipeline.rs -> classifier.rs
//!
//! ==============================================================================

use crate::error::DecodeError;
use serde_json::{Map, Value};

/// longest line we are willing to buffer without seeing a newline
pub const MAX_LINE_BYTES: usize = 4096;

/// outcome of decoding a single line
#[derive(Debug)]
pub enum Decoded {
    Record(Map<String, Value>),
    /// not a record candidate; dropped without a log line
    Ignored,
    Malformed(DecodeError),
}

pub fn decode_line(line: &str) -> Decoded {
    let line = line.trim();
    if line.is_empty() || !line.starts_with('{') {
        return Decoded::Ignored;
    }

    match serde_json::from_str::<Map<String, Value>>(line) {
        Ok(map) => Decoded::Record(map),
        Err(e) => Decoded::Malformed(DecodeError::Json(e)),
    }
}

/// shorten a line for log output without splitting a utf-8 character
pub fn truncate_for_log(line: &str, max_chars: usize) -> String {
    match line.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

// ==============================================================================
// line framing
// ==============================================================================
// serial reads return whatever bytes happen to be in the uart fifo, so a
// record can arrive split across several reads. the framer holds the tail
// until its newline shows up.

#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
    overflowed: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// append a chunk and return every line it completed (without newline)
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if byte == b'\n' {
                if self.overflowed {
                    // tail of an oversized line; its head is already gone
                    self.overflowed = false;
                } else {
                    lines.push(Self::to_text(&self.pending));
                }
                self.pending.clear();
                continue;
            }

            if self.pending.len() >= MAX_LINE_BYTES {
                tracing::warn!("Discarding serial line longer than {} bytes", MAX_LINE_BYTES);
                self.pending.clear();
                self.overflowed = true;
            }
            if !self.overflowed {
                self.pending.push(byte);
            }
        }

        lines
    }

    /// drop any partial line (used after a reconnect)
    pub fn reset(&mut self) {
        self.pending.clear();
        self.overflowed = false;
    }

    fn to_text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes)
            .trim_end_matches('\r')
            .to_string()
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_record() {
        match decode_line("  {\"mac\":\"AA:BB\",\"value\":1234}\r\n") {
            Decoded::Record(map) => {
                assert_eq!(map["mac"], "AA:BB");
                assert_eq!(map["value"], 1234);
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_text_is_ignored() {
        assert!(matches!(decode_line("hello"), Decoded::Ignored));
        assert!(matches!(decode_line(""), Decoded::Ignored));
        assert!(matches!(decode_line("   "), Decoded::Ignored));
        assert!(matches!(decode_line("I (312) gateway: ready"), Decoded::Ignored));
        assert!(matches!(decode_line("[1, 2]"), Decoded::Ignored));
    }

    #[test]
    fn test_broken_json_is_malformed() {
        assert!(matches!(
            decode_line("{not valid json"),
            Decoded::Malformed(DecodeError::Json(_))
        ));
        // an object followed by trailing garbage is not a record either
        assert!(matches!(
            decode_line("{\"a\":1} {\"b\":2}"),
            Decoded::Malformed(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", 50), "short");
        let long = "x".repeat(60);
        assert_eq!(truncate_for_log(&long, 50), format!("{}...", "x".repeat(50)));
        // multi-byte characters are not split
        assert_eq!(truncate_for_log("ááá", 2), "áá...");
    }

    #[test]
    fn test_framer_joins_split_records() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"value\":").is_empty());
        let lines = framer.push(b"12}\r\n{\"value\":13}\nboot");
        assert_eq!(lines, vec!["{\"value\":12}", "{\"value\":13}"]);
        assert_eq!(framer.push(b"\n"), vec!["boot"]);
    }

    #[test]
    fn test_framer_reset_drops_partial_line() {
        let mut framer = LineFramer::new();
        framer.push(b"{\"value\":");
        framer.reset();
        assert_eq!(framer.push(b"{\"value\":1}\n"), vec!["{\"value\":1}"]);
    }

    #[test]
    fn test_framer_discards_oversized_line() {
        let mut framer = LineFramer::new();
        let junk = vec![b'a'; MAX_LINE_BYTES + 10];
        assert!(framer.push(&junk).is_empty());
        let lines = framer.push(b"tail\n{\"ok\":true}\n");
        assert_eq!(lines, vec!["{\"ok\":true}"]);
    }

    #[test]
    fn test_framer_replaces_invalid_utf8() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"{\"a\":\"\xff\"}\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with('{'));
    }
}
