//! Redis pub/sub transport backend.
//!
//! Uses PUBLISH for outbound frames and PSUBSCRIBE listener tasks for
//! subscriptions. Each listener reconnects on its own with exponential
//! backoff: 1s doubling up to `reconnect_ceiling_secs`. While the backend is
//! marked disconnected, publishes fail fast instead of queueing.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use confab_common::TransportConfig;

use crate::frame::Frame;
use crate::traits::{now_ms, FrameReceiver, Transport, TransportError, TransportResult, TransportStatus};

/// Redis pub/sub transport.
pub struct RedisTransport {
    client: redis::Client,
    /// Connection manager for publishing (retries transient failures itself).
    conn_manager: RwLock<Option<redis::aio::ConnectionManager>>,
    /// Subscription listener tasks.
    subscription_handles: Arc<RwLock<Vec<tokio::task::JoinHandle<()>>>>,
    /// Set by the listener tasks; gates the fail-fast publish path.
    connected: Arc<AtomicBool>,
    connects: Arc<AtomicU64>,
    last_activity_ms: Arc<AtomicI64>,
    reconnect_ceiling: Duration,
}

impl RedisTransport {
    /// Connect to Redis and build the transport.
    pub async fn connect(config: &TransportConfig) -> TransportResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let conn_manager = client
            .get_connection_manager()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        tracing::info!(url = %config.redis_url, "Connected to Redis");

        Ok(Self {
            client,
            conn_manager: RwLock::new(Some(conn_manager)),
            subscription_handles: Arc::new(RwLock::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
            connects: Arc::new(AtomicU64::new(1)),
            last_activity_ms: Arc::new(AtomicI64::new(now_ms())),
            reconnect_ceiling: Duration::from_secs(config.reconnect_ceiling_secs.max(1)),
        })
    }

    /// Convert a topic pattern to a Redis glob pattern.
    ///
    /// Both `+` and `#` become `*`. Redis globs do not respect segment
    /// boundaries, so this over-matches; consumers filter precisely on the
    /// received topic.
    fn to_redis_pattern(pattern: &str) -> String {
        pattern.replace('+', "*").replace('#', "*")
    }

    /// Start a subscription listener for a pattern.
    fn start_subscription_listener(
        &self,
        pattern: String,
        sender: broadcast::Sender<Frame>,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let redis_pattern = Self::to_redis_pattern(&pattern);
        let connected = self.connected.clone();
        let connects = self.connects.clone();
        let last_activity = self.last_activity_ms.clone();
        let ceiling = self.reconnect_ceiling;

        tokio::spawn(async move {
            let mut delay = Duration::from_secs(1);
            let mut first = true;

            loop {
                // Pub/sub needs a dedicated connection
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to get pub/sub connection");
                        connected.store(false, Ordering::SeqCst);
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(ceiling);
                        continue;
                    }
                };

                if let Err(e) = pubsub.psubscribe(&redis_pattern).await {
                    tracing::error!(error = %e, pattern = %redis_pattern, "Failed to subscribe");
                    connected.store(false, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(ceiling);
                    continue;
                }

                connected.store(true, Ordering::SeqCst);
                if !first {
                    connects.fetch_add(1, Ordering::SeqCst);
                }
                first = false;
                delay = Duration::from_secs(1);

                tracing::info!(pattern = %redis_pattern, "Subscribed to Redis pattern");

                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let channel: String = match msg.get_channel() {
                        Ok(c) => c,
                        Err(_) => continue,
                    };

                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    last_activity.store(now_ms(), Ordering::Relaxed);

                    tracing::debug!(topic = %channel, "Received frame from Redis");

                    // Forward to local subscribers
                    let _ = sender.send(Frame::new(channel, payload));
                }

                // Connection lost, retry
                tracing::warn!(pattern = %redis_pattern, "Redis subscription lost, reconnecting");
                connected.store(false, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(ceiling);
            }
        })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, topic: &str, payload: String) -> TransportResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(
                "Redis connection is down".to_string(),
            ));
        }

        let mut conn_guard = self.conn_manager.write().await;
        let conn = conn_guard
            .as_mut()
            .ok_or_else(|| TransportError::Unavailable("Connection manager closed".to_string()))?;

        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(&payload)
            .query_async::<i64>(conn)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);

        tracing::debug!(topic = %topic, "Frame published to Redis");

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> TransportResult<FrameReceiver> {
        let (sender, receiver) = broadcast::channel(1024);

        let handle = self.start_subscription_listener(pattern.to_string(), sender);

        {
            let mut handles = self.subscription_handles.write().await;
            handles.push(handle);
        }

        tracing::debug!(pattern = %pattern, "Subscribed to topic pattern via Redis");

        Ok(FrameReceiver { inner: receiver })
    }

    fn status(&self) -> TransportStatus {
        TransportStatus {
            connected: self.connected.load(Ordering::SeqCst),
            connects: self.connects.load(Ordering::SeqCst),
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        let handles = {
            let mut h = self.subscription_handles.write().await;
            std::mem::take(&mut *h)
        };

        for handle in handles {
            handle.abort();
        }

        let mut conn = self.conn_manager.write().await;
        *conn = None;
        self.connected.store(false, Ordering::SeqCst);

        Ok(())
    }
}

// ============================================================================
// Redis Integration Tests (requires running Redis server)
// ============================================================================
