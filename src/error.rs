//! ==============================================================================
//! error.rs - fault taxonomy of the relay pipeline
//! ==============================================================================
//!
//! none of these escape the pipeline. transport faults are retried by the
//! supervisor, decode and delivery faults become a log line and a counter.
//! startup and configuration errors use anyhow instead.
//!
//! ==============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("read failed: {0}")]
    Read(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("collector answered {0}")]
    Rejected(reqwest::StatusCode),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("delivery queue full, reading dropped")]
    QueueFull,
    #[error("delivery worker stopped, reading dropped")]
    WorkerStopped,
}
