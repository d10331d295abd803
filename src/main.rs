//! ==============================================================================
//! main.rs - aguada relay entry point
//! ==============================================================================
//!
//! purpose:
//!     bridges the AGUADA usb gateway (esp32 receiving esp-now packets from
//!     the reservoir level nodes) to everything that wants its readings:
//!     the live dashboard, websocket clients and the backend api.
//!
//! responsibilities:
//!     - load configuration (config/relay.toml + command line)
//!     - own the serial supervisor on a dedicated blocking thread
//!     - serve the dashboard / poll api and the push channel
//!     - forward readings to the backend through the delivery worker
//!     - stop everything on ctrl-c / sigterm and print final counters
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                      relay (this file)                        │
//!     │  ┌──────────────────┐                                         │
//!     │  │ serial supervisor│  blocking thread                        │
//!     │  │  + pipeline      │──┬──> history buffer <── GET /api/readings
//!     │  └──────────────────┘  ├──> dispatcher ──────> websocket clients
//!     │                        └──> delivery queue ──> POST /api/telemetry
//!     │                                                               │
//!     │        one CancellationToken observed by every task           │
//!     └──────────────────────────────────────────────────────────────┘
//!
//! relationships:
//!     - config.rs     (RelayConfig, Args)
//!     - supervisor.rs (serial lifecycle) -> pipeline.rs (per-line work)
//!     - history.rs, dispatcher.rs, sink.rs (the three consumers' backends)
//!     - server.rs     (http + websocket)
//!
//! ==============================================================================

mod classifier;
mod config;
mod decoder;
mod dispatcher;
mod domain;
mod error;
mod history;
mod pipeline;
mod server;
mod sink;
mod supervisor;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::{Args, RelayConfig};
use dispatcher::Dispatcher;
use history::HistoryBuffer;
use pipeline::{Pipeline, RelayStats};
use server::ServerState;
use supervisor::{SerialConnector, Supervisor};

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // startup banner
    println!("===========================================================");
    println!("  AGUADA Relay - serial gateway bridge");
    println!("===========================================================");

    // step 1: load configuration
    let config = RelayConfig::from_args(&args)?;
    init_tracing(&config.logging.level);
    config.print_summary();

    // step 2: shutdown signal
    let shutdown = CancellationToken::new();
    spawn_signal_handlers(shutdown.clone());

    // step 3: shared state
    let history = Arc::new(HistoryBuffer::new(config.history.capacity));
    let dispatcher = Dispatcher::new(
        history.clone(),
        config.history.replay_limit,
        config.history.subscriber_queue,
    );
    let stats = Arc::new(RelayStats::default());

    // step 4: upstream delivery
    let (sink, sink_worker) = if config.mode.runs_upstream() {
        let upstream = sink::UpstreamSink::new(&config.upstream.base_url, config.upstream_timeout())?;
        let (handle, worker) =
            sink::spawn_worker(upstream, config.upstream.queue_depth, shutdown.clone());
        (Some(handle), Some(worker))
    } else {
        (None, None)
    };

    // step 5: web servers
    let mut servers: Vec<JoinHandle<()>> = Vec::new();
    if config.mode.runs_servers() {
        let state = ServerState {
            history: history.clone(),
            dispatcher: dispatcher.clone(),
            stats: stats.clone(),
            sink: sink.clone(),
            ws_port: config.server.ws_port,
            shutdown: shutdown.clone(),
        };

        let http = server::bind(&config.http_addr()).await?;
        let ws = server::bind(&config.ws_addr()).await?;
        tracing::info!("Dashboard live at http://localhost:{}", config.server.http_port);
        tracing::info!("Push channel at ws://localhost:{}/ws", config.server.ws_port);

        servers.push(spawn_server("http", http, server::http_router(state.clone()), &shutdown));
        servers.push(spawn_server("websocket", ws, server::push_router(state), &shutdown));
    }

    // step 6: serial ingestion on its own thread
    let pipeline = Pipeline::new(history.clone(), dispatcher.clone(), sink.clone(), stats.clone())
        .show_readings(config.logging.show_readings);
    let connector = SerialConnector::new(
        config.serial.path.clone(),
        config.serial.baud_rate,
        config.read_timeout(),
    );
    let supervisor = Supervisor::new(
        connector,
        config.reconnect_backoff(),
        tokio::runtime::Handle::current(),
    );
    let ingest_token = shutdown.clone();
    let ingest = tokio::task::spawn_blocking(move || {
        let mut pipeline = pipeline;
        supervisor.run(&ingest_token, &mut pipeline);
    });

    tracing::info!("Waiting for gateway packets...");

    // step 7: run until interrupted
    shutdown.cancelled().await;
    tracing::info!("Shutting down...");

    if let Err(e) = ingest.await {
        tracing::error!("Serial thread ended abnormally: {}", e);
    }
    for server in servers {
        let _ = server.await;
    }
    if let Some(worker) = sink_worker {
        let _ = worker.await;
    }

    // final statistics
    let relay = stats.snapshot();
    let upstream = sink.as_ref().map(|s| s.stats()).unwrap_or_default();
    tracing::info!(
        "Statistics: RX={}, TX={}, FAIL={} (readings={}, control={}, malformed={})",
        relay.records_received,
        upstream.delivered,
        upstream.failed,
        relay.readings_accepted,
        relay.control_messages,
        relay.malformed_lines
    );

    Ok(())
}

// ==============================================================================
// helpers
// ==============================================================================

/// RUST_LOG wins over the configured level
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// a server that dies takes the whole relay down with it
fn spawn_server(
    name: &'static str,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    shutdown: &CancellationToken,
) -> JoinHandle<()> {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = server::serve(listener, app, shutdown.clone()).await {
            tracing::error!("{} server error: {:#}", name, e);
            shutdown.cancel();
        }
    })
}

fn spawn_signal_handlers(shutdown: CancellationToken) {
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received interrupt");
                ctrl_c_token.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM");
                shutdown.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for SIGTERM: {}", e),
        }
    });
}
