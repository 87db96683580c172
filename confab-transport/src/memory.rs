//! In-memory transport for single-process use and tests.
//!
//! Uses tokio broadcast channels for local pub/sub. Unlike a broker, pattern
//! matching happens at publish time: every subscriber whose pattern matches
//! the topic receives the frame.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::frame::Frame;
use crate::topic::topic_matches;
use crate::traits::{now_ms, FrameReceiver, Transport, TransportResult, TransportStatus};

struct Subscriber {
    pattern: String,
    sender: broadcast::Sender<Frame>,
}

/// In-memory pub/sub transport.
pub struct InMemoryTransport {
    /// Pattern -> broadcast sender, matched against topics on publish.
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    /// Channel capacity per subscription.
    capacity: usize,
    frames_sent: AtomicU64,
    last_activity_ms: AtomicI64,
}

impl InMemoryTransport {
    /// Create a new in-memory transport with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new in-memory transport with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            capacity,
            frames_sent: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(0),
        }
    }

    /// Number of frames published so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, topic: &str, payload: String) -> TransportResult<()> {
        let frame = Frame::new(topic, payload);
        let subscribers = self.subscribers.read().await;

        let mut delivered = 0usize;
        for sub in subscribers.iter() {
            if topic_matches(&sub.pattern, topic) {
                // Ignore send errors when all receivers are gone
                if sub.sender.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);

        tracing::debug!(topic = %topic, delivered, "Frame published");

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> TransportResult<FrameReceiver> {
        let mut subscribers = self.subscribers.write().await;

        // Reuse the sender when the same pattern is already subscribed
        if let Some(existing) = subscribers.iter().find(|s| s.pattern == pattern) {
            return Ok(FrameReceiver {
                inner: existing.sender.subscribe(),
            });
        }

        let (sender, receiver) = broadcast::channel(self.capacity);
        subscribers.push(Subscriber {
            pattern: pattern.to_string(),
            sender,
        });

        tracing::debug!(pattern = %pattern, "Subscribed to topic pattern");

        Ok(FrameReceiver { inner: receiver })
    }

    fn status(&self) -> TransportStatus {
        TransportStatus {
            connected: true,
            connects: 1,
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        let mut subscribers = self.subscribers.write().await;
        subscribers.clear();
        Ok(())
    }
}
