//! ==============================================================================
//! sink.rs - best-effort forwarding of readings to the upstream collector
//! ==============================================================================
//!
//! purpose:
//!     every accepted reading is POSTed once to `<backend>/api/telemetry`
//!     with the node's own json fields as body. 200 and 201 count as
//!     delivered, anything else (other status, refused connection, dns
//!     failure, timeout) counts as failed. nothing is retried or re-queued.
//!
//! threading:
//!     the ingestion thread must never wait on the network, so it only
//!     `offer`s readings into a bounded queue. a single async worker drains
//!     the queue in acceptance order. a full queue means the collector is
//!     slower than the gateway; the reading is counted as failed and dropped.
//!
//! relationships:
//!     - fed by: pipeline.rs (SinkHandle::offer)
//!     - spawned by: main.rs (spawn_worker)
//!
//! ==============================================================================

use crate::domain::Reading;
use crate::error::DeliveryError;
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_QUEUE_DEPTH: usize = 64;
pub const TELEMETRY_PATH: &str = "/api/telemetry";

// ==============================================================================
// counters
// ==============================================================================

#[derive(Debug, Default)]
pub struct DeliveryStats {
    attempts: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliverySnapshot {
    pub attempts: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl DeliveryStats {
    fn record(&self, ok: bool) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

// ==============================================================================
// the sink itself
// ==============================================================================

#[derive(Clone)]
pub struct UpstreamSink {
    client: reqwest::Client,
    endpoint: String,
    stats: Arc<DeliveryStats>,
}

impl UpstreamSink {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build http client: {}", e))?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), TELEMETRY_PATH),
            stats: Arc::new(DeliveryStats::default()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[cfg(test)]
    pub fn stats(&self) -> DeliverySnapshot {
        self.stats.snapshot()
    }

    /// one POST, no retry; the outcome is counted and logged here
    pub async fn deliver(&self, reading: &Reading) -> Result<StatusCode, DeliveryError> {
        let result = self.post(reading).await;

        match &result {
            Ok(_) => {
                tracing::debug!("TX: {} -> backend OK", reading.device_id);
            }
            Err(DeliveryError::Rejected(status)) => {
                tracing::warn!("TX: {} -> backend FAIL (status {})", reading.device_id, status);
            }
            Err(e) => {
                tracing::error!("TX: {} -> backend FAIL ({})", reading.device_id, e);
            }
        }
        self.stats.record(result.is_ok());
        result
    }

    async fn post(&self, reading: &Reading) -> Result<StatusCode, DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&reading.fields)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            Ok(status)
        } else {
            let body = response.text().await.unwrap_or_default();
            if !body.is_empty() {
                tracing::debug!("Backend returned {}: {}", status, body);
            }
            Err(DeliveryError::Rejected(status))
        }
    }
}

// ==============================================================================
// queue + worker
// ==============================================================================

/// non-blocking entry point used by the ingestion thread
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<Arc<Reading>>,
    stats: Arc<DeliveryStats>,
}

impl SinkHandle {
    pub fn offer(&self, reading: Arc<Reading>) -> Result<(), DeliveryError> {
        match self.tx.try_send(reading) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(r)) => {
                tracing::warn!("TX: {} -> dropped, delivery queue full", r.device_id);
                self.stats.record(false);
                Err(DeliveryError::QueueFull)
            }
            Err(TrySendError::Closed(r)) => {
                tracing::warn!("TX: {} -> dropped, delivery worker stopped", r.device_id);
                self.stats.record(false);
                Err(DeliveryError::WorkerStopped)
            }
        }
    }

    pub fn stats(&self) -> DeliverySnapshot {
        self.stats.snapshot()
    }
}

/// start the delivery worker; it stops taking readings once `token` fires,
/// but a POST already in flight runs to completion or timeout. readings
/// still queued at that point, and any offered afterwards, count as failed.
pub fn spawn_worker(
    sink: UpstreamSink,
    queue_depth: usize,
    token: CancellationToken,
) -> (SinkHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Arc<Reading>>(queue_depth.max(1));
    let handle = SinkHandle {
        tx,
        stats: sink.stats.clone(),
    };

    let worker = tokio::spawn(async move {
        tracing::info!("Upstream delivery to {}", sink.endpoint());
        loop {
            let reading = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(r) => r,
                    None => break,
                },
            };
            // outcome already counted and logged
            let _ = sink.deliver(&reading).await;
        }

        // refuse further offers, then account for whatever was still queued
        rx.close();
        let mut abandoned = 0u64;
        while let Some(reading) = rx.recv().await {
            tracing::debug!("TX: {} -> not sent, shutting down", reading.device_id);
            sink.stats.record(false);
            abandoned += 1;
        }
        if abandoned > 0 {
            tracing::warn!("{} queued readings not delivered before shutdown", abandoned);
        }
        tracing::debug!("Upstream delivery worker stopped");
    });

    (handle, worker)
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::history::tests::reading;
    use axum::{extract::State, http::StatusCode as AxumStatus, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// in-process collector that records bodies and answers a fixed status
    pub(crate) struct Collector {
        pub base_url: String,
        pub bodies: Arc<Mutex<Vec<Value>>>,
    }

    pub(crate) async fn collector(status: u16, delay: Duration) -> Collector {
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let state = (bodies.clone(), status, delay);

        async fn handler(
            State((bodies, status, delay)): State<(Arc<Mutex<Vec<Value>>>, u16, Duration)>,
            Json(body): Json<Value>,
        ) -> AxumStatus {
            tokio::time::sleep(delay).await;
            bodies.lock().unwrap().push(body);
            AxumStatus::from_u16(status).unwrap()
        }

        let app = Router::new()
            .route(TELEMETRY_PATH, post(handler))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Collector {
            base_url: format!("http://{}", addr),
            bodies,
        }
    }

    fn tagged(value: f64) -> Reading {
        let mut r = reading(value);
        r.fields = json!({"mac": "AA:BB", "type": "distance", "value": value})
            .as_object()
            .cloned()
            .unwrap();
        r
    }

    #[test]
    fn test_endpoint_join() {
        let sink = UpstreamSink::new("http://localhost:3000/", DEFAULT_TIMEOUT).unwrap();
        assert_eq!(sink.endpoint(), "http://localhost:3000/api/telemetry");
    }

    #[tokio::test]
    async fn test_accepted_statuses() {
        for status in [200, 201] {
            let c = collector(status, Duration::ZERO).await;
            let sink = UpstreamSink::new(&c.base_url, DEFAULT_TIMEOUT).unwrap();
            assert!(sink.deliver(&tagged(1234.0)).await.is_ok());
            assert_eq!(
                sink.stats(),
                DeliverySnapshot { attempts: 1, delivered: 1, failed: 0 }
            );
            // body is the node's own mapping
            assert_eq!(c.bodies.lock().unwrap()[0]["mac"], "AA:BB");
        }
    }

    #[tokio::test]
    async fn test_server_error_counts_as_failure() {
        let c = collector(500, Duration::ZERO).await;
        let sink = UpstreamSink::new(&c.base_url, DEFAULT_TIMEOUT).unwrap();
        let err = sink.deliver(&tagged(1.0)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected(s) if s.as_u16() == 500));
        assert_eq!(
            sink.stats(),
            DeliverySnapshot { attempts: 1, delivered: 0, failed: 1 }
        );
    }

    #[tokio::test]
    async fn test_other_2xx_is_not_accepted() {
        let c = collector(204, Duration::ZERO).await;
        let sink = UpstreamSink::new(&c.base_url, DEFAULT_TIMEOUT).unwrap();
        assert!(sink.deliver(&tagged(1.0)).await.is_err());
        assert_eq!(sink.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_connection_refused_counts_as_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = UpstreamSink::new(&format!("http://{}", addr), DEFAULT_TIMEOUT).unwrap();
        let err = sink.deliver(&tagged(1.0)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Http(_)));
        assert_eq!(sink.stats().failed, 1);
        assert_eq!(sink.stats().delivered, 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let c = collector(200, Duration::from_secs(2)).await;
        let sink = UpstreamSink::new(&c.base_url, Duration::from_millis(200)).unwrap();
        let err = sink.deliver(&tagged(1.0)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Http(ref e) if e.is_timeout()));
        assert_eq!(sink.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_worker_delivers_in_order() {
        let c = collector(201, Duration::ZERO).await;
        let sink = UpstreamSink::new(&c.base_url, DEFAULT_TIMEOUT).unwrap();
        let token = CancellationToken::new();
        let (handle, worker) = spawn_worker(sink, 16, token.clone());

        for i in 0..5 {
            handle.offer(Arc::new(tagged(i as f64))).unwrap();
        }
        for _ in 0..100 {
            if handle.stats().attempts == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.stats().delivered, 5);
        let values: Vec<f64> = c
            .bodies
            .lock()
            .unwrap()
            .iter()
            .map(|b| b["value"].as_f64().unwrap())
            .collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0]);

        token.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_accounts_for_every_offer() {
        let c = collector(200, Duration::from_millis(300)).await;
        let sink = UpstreamSink::new(&c.base_url, DEFAULT_TIMEOUT).unwrap();
        let token = CancellationToken::new();
        let (handle, worker) = spawn_worker(sink, 16, token.clone());

        for i in 0..4 {
            handle.offer(Arc::new(tagged(i as f64))).unwrap();
        }
        // let the worker start on the first reading
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        worker.await.unwrap();

        let err = handle.offer(Arc::new(tagged(9.0))).unwrap_err();
        assert!(matches!(err, DeliveryError::WorkerStopped));

        let stats = handle.stats();
        assert_eq!(stats.attempts, 5);
        assert_eq!(stats.delivered + stats.failed, 5);
        assert!(stats.failed >= 4);
        assert_eq!(c.bodies.lock().unwrap().len() as u64, stats.delivered);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        // slow collector keeps the worker busy with the first reading
        let c = collector(200, Duration::from_millis(500)).await;
        let sink = UpstreamSink::new(&c.base_url, DEFAULT_TIMEOUT).unwrap();
        let token = CancellationToken::new();
        let (handle, worker) = spawn_worker(sink, 1, token.clone());

        let mut dropped = 0;
        for i in 0..10 {
            if let Err(DeliveryError::QueueFull) = handle.offer(Arc::new(tagged(i as f64))) {
                dropped += 1;
            }
        }
        assert!(dropped >= 8, "expected most offers to overflow, got {}", dropped);
        assert_eq!(handle.stats().failed, dropped);

        token.cancel();
        worker.await.unwrap();
    }
}
