//! Best-effort persistence of resolved turns.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::session::Role;

/// A persisted turn record.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    /// Storage id assigned by the sink
    pub message_id: String,
    pub session_id: String,
    pub role: Role,
    pub text: String,
    /// Arbitrary metadata (request id, latency, far-end extras)
    pub metadata: Option<Value>,
    /// Unix millis at persist time
    pub recorded_at_ms: i64,
}

/// Sink for conversation turns: store and report health.
///
/// Persistence is best-effort relative to the live conversation: callers
/// log failures and carry on, they never fail the call over a sink error.
#[async_trait]
pub trait TurnSink: Send + Sync {
    /// Sink name (e.g., "memory")
    fn name(&self) -> &str;

    /// Persist one turn, returning the storage id it was filed under.
    async fn persist_turn(
        &self,
        session_id: &str,
        role: Role,
        text: &str,
        metadata: Option<Value>,
    ) -> anyhow::Result<String>;

    /// Health check: returns true if the sink is operational.
    async fn health_check(&self) -> bool;
}

/// In-process sink backed by a plain vector.
///
/// Suits single-process runs and tests; nothing survives a restart.
#[derive(Default)]
pub struct MemorySink {
    turns: Mutex<Vec<TurnRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything persisted so far, oldest first.
    pub async fn turns(&self) -> Vec<TurnRecord> {
        self.turns.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.turns.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.turns.lock().await.is_empty()
    }
}

#[async_trait]
impl TurnSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn persist_turn(
        &self,
        session_id: &str,
        role: Role,
        text: &str,
        metadata: Option<Value>,
    ) -> anyhow::Result<String> {
        let message_id = uuid::Uuid::new_v4().simple().to_string();
        let record = TurnRecord {
            message_id: message_id.clone(),
            session_id: session_id.to_string(),
            role,
            text: text.to_string(),
            metadata,
            recorded_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.turns.lock().await.push(record);
        Ok(message_id)
    }

    async fn health_check(&self) -> bool {
        true
    }
}
