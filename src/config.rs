//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `relay.toml` and the command line flags.
//!     precedence: built-in defaults < config file < command line.
//!
//! structure:
//!     - mode: which consumers run (bridge / monitor / full)
//!     - SerialConfig: gateway device, baud rate, read timeout, reconnect backoff
//!     - UpstreamConfig: collector base url, request timeout, delivery queue
//!     - ServerConfig: bind address, dashboard and push ports
//!     - HistoryConfig: buffer capacity, replay size, per-client queue
//!     - LoggingConfig: log level, per-reading log lines
//!
//! ==============================================================================

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(windows)]
const DEFAULT_SERIAL_PATH: &str = "COM3";
#[cfg(not(windows))]
const DEFAULT_SERIAL_PATH: &str = "/dev/ttyACM0";

/// which halves of the relay run
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// serial -> upstream collector only
    Bridge,
    /// serial -> dashboard, poll api and push channel only
    Monitor,
    /// both
    #[default]
    Full,
}

impl RelayMode {
    pub fn runs_servers(self) -> bool {
        !matches!(self, RelayMode::Bridge)
    }

    pub fn runs_upstream(self) -> bool {
        !matches!(self, RelayMode::Monitor)
    }

    /// the bridge waits longer between reconnects than the dashboards
    pub fn default_backoff(self) -> Duration {
        match self {
            RelayMode::Bridge => Duration::from_secs(5),
            RelayMode::Monitor | RelayMode::Full => Duration::from_secs(2),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub mode: RelayMode,
    pub serial: SerialConfig,
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    /// unset = mode default
    pub reconnect_backoff_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub queue_depth: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub http_port: u16,
    pub ws_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
    pub replay_limit: usize,
    pub subscriber_queue: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_readings: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_SERIAL_PATH.to_string(),
            baud_rate: 115_200,
            read_timeout_ms: crate::supervisor::DEFAULT_READ_TIMEOUT.as_millis() as u64,
            reconnect_backoff_secs: None,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            timeout_secs: crate::sink::DEFAULT_TIMEOUT.as_secs(),
            queue_depth: crate::sink::DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            http_port: 8080,
            ws_port: 8081,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: crate::history::DEFAULT_CAPACITY,
            replay_limit: crate::dispatcher::DEFAULT_REPLAY_LIMIT,
            subscriber_queue: crate::dispatcher::DEFAULT_SUBSCRIBER_QUEUE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_readings: true,
        }
    }
}

// ==============================================================================
// command line
// ==============================================================================

/// AGUADA relay: serial gateway -> dashboard, push channel and backend
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Serial device of the USB gateway
    #[arg(short, long)]
    pub port: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    pub baudrate: Option<u32>,

    /// Backend base url (readings are POSTed to <backend>/api/telemetry)
    #[arg(short = 'u', long)]
    pub backend: Option<String>,

    /// Dashboard / poll api port
    #[arg(long)]
    pub http: Option<u16>,

    /// Websocket push port
    #[arg(long)]
    pub ws: Option<u16>,

    /// Which consumers to run
    #[arg(short, long, value_enum)]
    pub mode: Option<RelayMode>,

    /// Readings kept in memory
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Seconds to wait before reconnecting the serial port
    #[arg(long)]
    pub backoff: Option<u64>,

    /// Config file (default: config/relay.toml if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl RelayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Load from the usual locations, falling back to defaults
    pub fn discover() -> Self {
        let paths = [
            PathBuf::from("config").join("relay.toml"),
            PathBuf::from("..").join("config").join("relay.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: {:#}", e);
                    }
                }
            }
        }

        println!("[CONFIG] No config file found - using defaults");
        Self::default()
    }

    /// file (explicit or discovered) + flags, validated
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::discover(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(port) = &args.port {
            self.serial.path = port.clone();
        }
        if let Some(baud) = args.baudrate {
            self.serial.baud_rate = baud;
        }
        if let Some(backend) = &args.backend {
            self.upstream.base_url = backend.clone();
        }
        if let Some(http) = args.http {
            self.server.http_port = http;
        }
        if let Some(ws) = args.ws {
            self.server.ws_port = ws;
        }
        if let Some(mode) = args.mode {
            self.mode = mode;
        }
        if let Some(capacity) = args.capacity {
            self.history.capacity = capacity;
        }
        if let Some(backoff) = args.backoff {
            self.serial.reconnect_backoff_secs = Some(backoff);
        }
        if args.verbose {
            self.logging.level = "debug".to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.path.trim().is_empty() {
            bail!("serial.path must not be empty");
        }
        if self.serial.baud_rate == 0 {
            bail!("serial.baud_rate must be greater than 0");
        }
        if self.history.capacity == 0 {
            bail!("history.capacity must be at least 1");
        }
        if self.history.replay_limit == 0 {
            bail!("history.replay_limit must be at least 1");
        }
        if self.mode.runs_servers() && self.server.http_port == self.server.ws_port {
            bail!(
                "server.http_port and server.ws_port must differ (both {})",
                self.server.http_port
            );
        }
        if self.mode.runs_upstream() {
            let url = reqwest::Url::parse(&self.upstream.base_url)
                .with_context(|| format!("Invalid backend url {}", self.upstream.base_url))?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("backend url must be http(s), got {}", self.upstream.base_url);
            }
            if self.upstream.timeout_secs == 0 {
                bail!("upstream.timeout_secs must be greater than 0");
            }
        }
        Ok(())
    }

    pub fn reconnect_backoff(&self) -> Duration {
        self.serial
            .reconnect_backoff_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.mode.default_backoff())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.serial.read_timeout_ms.max(1))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.http_port)
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.ws_port)
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│           RELAY CONFIGURATION           │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Mode: {:?}", self.mode);
        println!("│ Serial: {} @ {} baud", self.serial.path, self.serial.baud_rate);
        println!("│ Reconnect backoff: {}s", self.reconnect_backoff().as_secs());
        if self.mode.runs_upstream() {
            println!("│ Backend: {}", self.upstream.base_url);
        }
        if self.mode.runs_servers() {
            println!("│ HTTP: http://localhost:{}", self.server.http_port);
            println!("│ WS:   ws://localhost:{}/ws", self.server.ws_port);
        }
        println!("│ History: {} readings", self.history.capacity);
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}
