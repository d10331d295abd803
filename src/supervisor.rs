//! ==============================================================================
//! supervisor.rs - serial connection lifecycle (connect, read, reconnect)
//! ==============================================================================
//!
//! purpose:
//!     owns the usb gateway link for the whole process lifetime. the link is
//!     expected to come and go (gateway reset, cable pulled, port busy), so
//!     every fault ends in the same place: log it, back off, try again.
//!
//! state machine:
//!
//!     ┌──────────────┐  connect()   ┌────────────┐   ok    ┌───────────┐
//!     │ DISCONNECTED │ ───────────> │ CONNECTING │ ──────> │ CONNECTED │
//!     └──────────────┘              └────────────┘         └───────────┘
//!            ^   ^    open failed          │                     │
//!            │   └─────────────────────────┘                     │
//!            └────────────────── read error ─────────────────────┘
//!
//!     every return to DISCONNECTED waits `backoff` before the next attempt.
//!     no retry limit; only the cancellation token ends the loop.
//!
//! threading:
//!     runs on a dedicated blocking thread. reads block for at most the port
//!     timeout (~1s), which is also how often the token is checked while
//!     connected. the backoff wait wakes immediately on cancellation.
//!
//! relationships:
//!     - uses: decoder.rs (LineFramer)
//!     - drives: any LinkHandler, in production pipeline.rs
//!
//! ==============================================================================

use crate::decoder::LineFramer;
use crate::domain::LinkState;
use crate::error::TransportError;
use std::io::{ErrorKind, Read};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
/// pause when a read returns no bytes, keeps the loop from spinning
const IDLE_YIELD: Duration = Duration::from_millis(5);
const READ_CHUNK: usize = 1024;

/// receives everything the supervisor produces
pub trait LinkHandler {
    fn on_line(&mut self, line: &str);
    fn on_link_state(&mut self, state: LinkState);
}

/// opens the byte stream; the serial port in production, a script in tests
pub trait Connector: Send {
    fn describe(&self) -> String;
    fn connect(&mut self) -> Result<Box<dyn Read + Send>, TransportError>;
}

// ==============================================================================
// serial port connector
// ==============================================================================

pub struct SerialConnector {
    path: String,
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            read_timeout,
        }
    }
}

impl Connector for SerialConnector {
    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud_rate)
    }

    fn connect(&mut self) -> Result<Box<dyn Read + Send>, TransportError> {
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(self.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| TransportError::Open {
                path: self.path.clone(),
                source: e.into(),
            })?;

        Ok(Box::new(SerialLink(port)))
    }
}

struct SerialLink(Box<dyn serialport::SerialPort>);

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

// ==============================================================================
// supervisor
// ==============================================================================

pub struct Supervisor<C: Connector> {
    connector: C,
    backoff: Duration,
    runtime: Handle,
    state: LinkState,
    framer: LineFramer,
}

impl<C: Connector> Supervisor<C> {
    /// `runtime` is only used to wait out the backoff against the token
    pub fn new(connector: C, backoff: Duration, runtime: Handle) -> Self {
        Self {
            connector,
            backoff,
            runtime,
            state: LinkState::Disconnected,
            framer: LineFramer::new(),
        }
    }

    /// blocking; returns only after `token` is cancelled
    pub fn run<H: LinkHandler>(mut self, token: &CancellationToken, handler: &mut H) {
        let target = self.connector.describe();
        tracing::info!("Serial supervisor starting on {}", target);
        handler.on_link_state(self.state);

        while !token.is_cancelled() {
            self.transition(LinkState::Connecting, handler);

            match self.connector.connect() {
                Ok(mut link) => {
                    tracing::info!("Connected to {}", target);
                    self.transition(LinkState::Connected, handler);
                    // a partial line from the previous link is never completed
                    self.framer.reset();

                    if let Err(e) = pump(link.as_mut(), &mut self.framer, token, handler) {
                        tracing::error!("Serial error on {}: {}", target, e);
                    }
                    // dropping the link closes the port
                }
                Err(e) => {
                    tracing::error!("Serial connect failed: {}", e);
                }
            }

            self.transition(LinkState::Disconnected, handler);
            if token.is_cancelled() {
                break;
            }

            tracing::info!("Reconnecting in {}s...", self.backoff.as_secs_f32());
            if !self.wait_backoff(token) {
                break;
            }
        }

        self.transition(LinkState::Disconnected, handler);
        tracing::info!("Serial supervisor stopped");
    }

    fn transition<H: LinkHandler>(&mut self, next: LinkState, handler: &mut H) {
        if self.state != next {
            tracing::debug!("Serial link {} -> {}", self.state, next);
            self.state = next;
            handler.on_link_state(next);
        }
    }

    /// false if cancelled while waiting
    fn wait_backoff(&self, token: &CancellationToken) -> bool {
        let backoff = self.backoff;
        self.runtime.block_on(async {
            tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(backoff) => true,
            }
        })
    }
}

/// read until an i/o fault (Err) or cancellation (Ok)
fn pump<H: LinkHandler>(
    link: &mut (dyn Read + Send),
    framer: &mut LineFramer,
    token: &CancellationToken,
    handler: &mut H,
) -> Result<(), TransportError> {
    let mut buf = [0u8; READ_CHUNK];

    while !token.is_cancelled() {
        match link.read(&mut buf) {
            Ok(0) => std::thread::sleep(IDLE_YIELD),
            Ok(n) => {
                for line in framer.push(&buf[..n]) {
                    handler.on_line(&line);
                }
            }
            // port timeout with nothing to read, the normal idle case
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                tracing::debug!("Serial read interrupted, retrying");
            }
            Err(e) => return Err(TransportError::Read(e)),
        }
    }
    Ok(())
}
