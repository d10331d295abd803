//! ==============================================================================
//! server.rs - dashboard, poll api and websocket push channel
//! ==============================================================================
//!
//! routes (http port, default 8080):
//!     GET /              dashboard page (static, push port substituted in)
//!     GET /api/readings  newest 100 readings as a json array, newest first
//!     GET /api/stats     relay + delivery counters, link state, latest id
//!
//! routes (push port, default 8081):
//!     GET /ws  (and /)   websocket; {"type":"history"} first, then
//!                        {"type":"status"} and one {"type":"reading"} per
//!                        accepted reading, in acceptance order
//!
//! both servers shut down gracefully when the shared token is cancelled.
//!
//! ==============================================================================

use crate::dispatcher::Dispatcher;
use crate::domain::{LinkState, Reading};
use crate::history::HistoryBuffer;
use crate::pipeline::{RelaySnapshot, RelayStats};
use crate::sink::{DeliverySnapshot, SinkHandle};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// readings returned by the poll api
pub const POLL_LIMIT: usize = 100;
/// a websocket write that takes longer than this marks the client dead
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

const DASHBOARD_TEMPLATE: &str = include_str!("../static/dashboard.html");

// ==============================================================================
// shared state
// ==============================================================================

#[derive(Clone)]
pub struct ServerState {
    pub history: Arc<HistoryBuffer>,
    pub dispatcher: Dispatcher,
    pub stats: Arc<RelayStats>,
    pub sink: Option<SinkHandle>,
    pub ws_port: u16,
    pub shutdown: CancellationToken,
}

#[derive(Serialize)]
struct StatsResponse {
    relay: RelaySnapshot,
    upstream: Option<DeliverySnapshot>,
    serial: LinkState,
    latest_id: u64,
    buffered: usize,
    capacity: usize,
    subscribers: usize,
}

// ==============================================================================
// routers
// ==============================================================================

pub fn http_router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(dashboard_handler))
        .route("/index.html", get(dashboard_handler))
        .route("/api/readings", get(readings_handler))
        .route("/api/stats", get(stats_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn push_router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// bind first so a busy port fails startup instead of a background task
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))
}

pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")
}

// ==============================================================================
// handlers
// ==============================================================================

async fn dashboard_handler(State(state): State<ServerState>) -> Html<String> {
    Html(render_dashboard(state.ws_port))
}

fn render_dashboard(ws_port: u16) -> String {
    DASHBOARD_TEMPLATE.replace("__WS_PORT__", &ws_port.to_string())
}

async fn readings_handler(State(state): State<ServerState>) -> Json<Vec<Arc<Reading>>> {
    Json(state.history.snapshot(POLL_LIMIT))
}

async fn stats_handler(State(state): State<ServerState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        relay: state.stats.snapshot(),
        upstream: state.sink.as_ref().map(SinkHandle::stats),
        serial: state.dispatcher.link_state(),
        latest_id: state.history.latest_id(),
        buffered: state.history.len(),
        capacity: state.history.capacity(),
        subscribers: state.dispatcher.subscriber_count(),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_session(socket, state))
}

/// one websocket client: forward its subscription until either side stops
async fn push_session(socket: WebSocket, state: ServerState) {
    let mut subscription = state.dispatcher.subscribe();
    let id = subscription.id();
    tracing::info!("Push client {} connected", id);

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            next = subscription.recv() => {
                // None: the dispatcher dropped us for falling behind
                let Some(message) = next else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Failed to encode push message: {}", e);
                        continue;
                    }
                };
                match tokio::time::timeout(SEND_TIMEOUT, sender.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // client chatter is ignored, pings are answered by axum
                Some(Ok(_)) => {}
            },
        }
    }

    drop(subscription);
    tracing::info!("Push client {} disconnected", id);
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use serde_json::Value;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    const LINE: &str = r#"{"mac":"AA:BB","type":"distance","value":1234,"rssi":-50,"uptime":10}"#;

    struct Harness {
        state: ServerState,
        pipeline: Pipeline,
        http: String,
        ws: String,
    }

    async fn harness() -> Harness {
        let history = Arc::new(HistoryBuffer::new(1000));
        let dispatcher = Dispatcher::new(history.clone(), 100, 64);
        let stats = Arc::new(RelayStats::default());
        let pipeline = Pipeline::new(history.clone(), dispatcher.clone(), None, stats.clone());

        let http_listener = bind("127.0.0.1:0").await.unwrap();
        let ws_listener = bind("127.0.0.1:0").await.unwrap();
        let http = format!("http://{}", http_listener.local_addr().unwrap());
        let ws = format!("ws://{}/ws", ws_listener.local_addr().unwrap());

        let state = ServerState {
            history,
            dispatcher,
            stats,
            sink: None,
            ws_port: ws_listener.local_addr().unwrap().port(),
            shutdown: CancellationToken::new(),
        };
        tokio::spawn(serve(http_listener, http_router(state.clone()), state.shutdown.clone()));
        tokio::spawn(serve(ws_listener, push_router(state.clone()), state.shutdown.clone()));

        Harness { state, pipeline, http, ws }
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for push message")
                .expect("stream ended")
                .expect("websocket error");
            if msg.is_text() {
                return serde_json::from_str(msg.to_text().unwrap()).unwrap();
            }
        }
    }

    #[test]
    fn test_dashboard_gets_ws_port() {
        let html = render_dashboard(9999);
        assert!(html.contains("9999"));
        assert!(!html.contains("__WS_PORT__"));
    }

    #[tokio::test]
    async fn test_poll_endpoint_newest_first_and_capped() {
        let mut h = harness().await;
        for _ in 0..(POLL_LIMIT + 20) {
            h.pipeline.ingest_line(LINE);
        }

        let body: Vec<Value> = reqwest::get(format!("{}/api/readings", h.http))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.len(), POLL_LIMIT);
        assert_eq!(body[0]["id"], (POLL_LIMIT + 20) as u64);
        assert_eq!(body[1]["id"], (POLL_LIMIT + 19) as u64);
        assert_eq!(body[0]["mac"], "AA:BB");
        // dd/mm/yyyy hh:mm:ss
        let datetime = body[0]["datetime"].as_str().unwrap();
        assert_eq!(datetime.len(), 19);
        assert_eq!(&datetime[2..3], "/");
        assert_eq!(&datetime[5..6], "/");

        h.state.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let mut h = harness().await;
        h.pipeline.ingest_line(LINE);
        h.pipeline.ingest_line(r#"{"type":"gateway_boot"}"#);

        let body: Value = reqwest::get(format!("{}/api/stats", h.http))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["relay"]["readings_accepted"], 1);
        assert_eq!(body["relay"]["control_messages"], 1);
        assert_eq!(body["latest_id"], 1);
        assert_eq!(body["serial"], "disconnected");
        assert!(body["upstream"].is_null());

        h.state.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_push_history_then_live() {
        let mut h = harness().await;
        h.pipeline.ingest_line(LINE);
        h.pipeline.ingest_line(LINE);

        let (mut ws, _) = tokio_tungstenite::connect_async(h.ws.as_str()).await.unwrap();

        let history = next_json(&mut ws).await;
        assert_eq!(history["type"], "history");
        let ids: Vec<u64> = history["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 1]);

        let status = next_json(&mut ws).await;
        assert_eq!(status["type"], "status");

        h.pipeline.ingest_line(LINE);
        let live = next_json(&mut ws).await;
        assert_eq!(live["type"], "reading");
        assert_eq!(live["data"]["id"], 3);

        h.state.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_dead_client_does_not_stop_healthy_one() {
        let mut h = harness().await;
        let (mut healthy, _) = tokio_tungstenite::connect_async(h.ws.as_str()).await.unwrap();
        let (dead, _) = tokio_tungstenite::connect_async(h.ws.as_str()).await.unwrap();
        next_json(&mut healthy).await;
        next_json(&mut healthy).await;

        drop(dead);
        // give the server a moment to notice the closed socket
        for _ in 0..100 {
            if h.state.dispatcher.subscriber_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for _ in 0..3 {
            h.pipeline.ingest_line(LINE);
        }
        for expected in 1..=3u64 {
            let msg = next_json(&mut healthy).await;
            assert_eq!(msg["data"]["id"], expected);
        }

        h.state.shutdown.cancel();
    }
}
