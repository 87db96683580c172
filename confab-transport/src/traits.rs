//! Transport trait and shared transport types.
//!
//! A [`Transport`] wraps a pub/sub client behind a uniform publish/subscribe
//! surface. Delivery of subscribed frames happens on transport-owned tasks;
//! consumers receive them through a [`FrameReceiver`] and must hand work off
//! quickly instead of blocking the receive loop.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::frame::Frame;

// ============================================================================
// Error Types
// ============================================================================

/// Transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection error to the backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Subscription error.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Publish error.
    #[error("Publish error: {0}")]
    Publish(String),

    /// Backend not available; publishes fail fast instead of queueing.
    #[error("Transport not available: {0}")]
    Unavailable(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

impl From<TransportError> for confab_common::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Subscription(msg) => confab_common::Error::Internal(msg),
            other => confab_common::Error::TransportUnavailable(other.to_string()),
        }
    }
}

// ============================================================================
// Liveness Snapshot
// ============================================================================

/// Point-in-time liveness information for a transport.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct TransportStatus {
    /// Whether the backend currently accepts publishes.
    pub connected: bool,
    /// Number of connect transitions observed (initial connect included).
    pub connects: u64,
    /// Unix-millis timestamp of the last frame sent or received, 0 if none.
    pub last_activity_ms: i64,
}

/// Current unix time in milliseconds.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Trait for pub/sub transport implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Backend name for logging ("memory", "redis").
    fn name(&self) -> &'static str;

    /// Publish a payload to a topic.
    ///
    /// Fails fast with [`TransportError::Unavailable`] while the backend is
    /// disconnected; nothing is queued for later delivery.
    async fn publish(&self, topic: &str, payload: String) -> TransportResult<()>;

    /// Subscribe to a topic pattern.
    ///
    /// Pattern supports wildcards:
    /// - `+` matches exactly one segment (e.g. `chat/+/reply`)
    /// - `#` matches the remainder, including nothing (e.g. `chat/#`)
    async fn subscribe(&self, pattern: &str) -> TransportResult<FrameReceiver>;

    /// Current liveness snapshot.
    fn status(&self) -> TransportStatus;

    /// Close the transport and drop all subscriptions.
    async fn close(&self) -> TransportResult<()>;
}

/// Frame receiver for subscriptions.
pub struct FrameReceiver {
    pub(crate) inner: broadcast::Receiver<Frame>,
}

impl FrameReceiver {
    /// Receive the next frame.
    ///
    /// Returns `None` once the subscription is closed. A lagging receiver
    /// skips the overwritten frames and keeps going.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.inner.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Subscriber lagging, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ============================================================================
// Transport Factory
// ============================================================================

/// Create a transport from configuration.
///
/// `transport.backend` selects the implementation: "memory" for the
/// in-process backend, "redis" for Redis pub/sub (requires the
/// `redis-backend` feature; falls back to in-memory with a warning when the
/// feature is compiled out).
pub async fn create_transport(
    config: &confab_common::TransportConfig,
) -> TransportResult<Arc<dyn Transport>> {
    match config.backend.as_str() {
        "redis" => {
            #[cfg(feature = "redis-backend")]
            {
                let transport = crate::redis::RedisTransport::connect(config).await?;
                Ok(Arc::new(transport))
            }
            #[cfg(not(feature = "redis-backend"))]
            {
                tracing::warn!(
                    "Redis backend feature not enabled. Falling back to in-memory transport. \
                     Enable with: cargo build --features redis-backend"
                );
                Ok(Arc::new(crate::memory::InMemoryTransport::new()))
            }
        }
        _ => Ok(Arc::new(crate::memory::InMemoryTransport::new())),
    }
}
