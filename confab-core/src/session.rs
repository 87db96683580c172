//! Bounded session store with LRU eviction.
//!
//! Sessions are held in an [`lru::LruCache`] with a hard capacity; creating
//! past the ceiling evicts the least-recently-used session. Every lookup
//! promotes the session, so eviction order is exactly last-access order.
//! Dialog mutation happens under a per-slot async mutex; the store's own
//! lock guards only the index and is never held across an await.

use chrono::Utc;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::context::MemoryState;

/// Message role in a conversation dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message, always the first dialog entry
    System,
    /// User message
    User,
    /// Assistant (far end) response
    Assistant,
}

impl Role {
    /// Convert to string representation for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse from string representation.
    #[allow(clippy::match_same_arms)]
    pub fn parse(s: &str) -> Self {
        match s {
            "system" => Self::System,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            _ => Self::User, // Default fallback
        }
    }
}

/// A single message in a session dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogMessage {
    pub role: Role,
    pub content: String,
}

impl DialogMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Mutable per-session state, guarded by the slot mutex.
#[derive(Debug, Default)]
pub struct SessionState {
    pub dialog: Vec<DialogMessage>,
    pub turn_count: u64,
    pub memory: Option<MemoryState>,
}

/// One resident session.
///
/// Slots are shared by `Arc` between the store and in-flight calls. A slot
/// evicted from the store stays alive while a call still holds it; writes
/// land on the detached slot and vanish when the last holder drops it, so
/// late completions never crash and never reach live state.
pub struct SessionSlot {
    id: String,
    created_at_ms: i64,
    last_access_ms: AtomicI64,
    state: Mutex<SessionState>,
}

impl SessionSlot {
    fn new(id: &str, system_prompt: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: id.to_string(),
            created_at_ms: now,
            last_access_ms: AtomicI64::new(now),
            state: Mutex::new(SessionState {
                dialog: vec![DialogMessage::system(system_prompt)],
                turn_count: 0,
                memory: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn last_access_ms(&self) -> i64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    /// Lock the mutable state. Held across the whole ask call so turns on
    /// one session are serialized.
    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    fn touch_access(&self) {
        self.last_access_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Bounded store of resident sessions.
pub struct SessionStore {
    slots: Mutex<LruCache<String, Arc<SessionSlot>>>,
    capacity: usize,
}

impl SessionStore {
    /// Create a store with the given session ceiling (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the session, creating it when missing.
    ///
    /// Creation is idempotent: the single index lock makes concurrent calls
    /// for the same id single-flight, and an existing session keeps its
    /// dialog (the system prompt seeds only a fresh one). Creating past the
    /// ceiling evicts the least-recently-used session.
    pub async fn get_or_create(&self, id: &str, system_prompt: &str) -> Arc<SessionSlot> {
        let mut slots = self.slots.lock().await;

        if let Some(slot) = slots.get(id) {
            slot.touch_access();
            return Arc::clone(slot);
        }

        let slot = Arc::new(SessionSlot::new(id, system_prompt));
        if let Some((evicted_id, _)) = slots.push(id.to_string(), Arc::clone(&slot)) {
            tracing::info!(
                session_id = %evicted_id,
                capacity = self.capacity,
                "Session evicted to stay under ceiling"
            );
        }

        tracing::debug!(session_id = %id, "Session created");
        slot
    }

    /// Get an existing session, promoting its recency.
    pub async fn get(&self, id: &str) -> Option<Arc<SessionSlot>> {
        let mut slots = self.slots.lock().await;
        slots.get(id).map(|slot| {
            slot.touch_access();
            Arc::clone(slot)
        })
    }

    /// Refresh a session's recency without touching its dialog state.
    ///
    /// Only the index lock is taken, so this is safe while another task
    /// holds the session's mutator lock.
    pub async fn touch(&self, id: &str) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.get(id) {
            Some(slot) => {
                slot.touch_access();
                true
            }
            None => false,
        }
    }

    /// Reset a session's dialog to its system message and wipe its context
    /// memory, keeping the slot resident. Returns false for unknown ids.
    pub async fn clear(&self, id: &str) -> bool {
        let Some(slot) = self.get(id).await else {
            tracing::debug!(session_id = %id, "Clear for missing session dropped");
            return false;
        };

        let mut state = slot.lock().await;
        state.dialog.retain(|m| m.role == Role::System);
        state.dialog.truncate(1);
        state.turn_count = 0;
        state.memory = None;
        true
    }

    /// Remove a session entirely. Returns false for unknown ids.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.slots.lock().await.pop(id).is_some();
        if removed {
            tracing::debug!(session_id = %id, "Session removed");
        }
        removed
    }

    /// Number of resident sessions.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    /// Ids of resident sessions, most recently used first.
    pub async fn session_ids(&self) -> Vec<String> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_string_roundtrip() {
        assert_eq!(Role::parse(Role::System.as_str()), Role::System);
        assert_eq!(Role::parse(Role::User.as_str()), Role::User);
        assert_eq!(Role::parse(Role::Assistant.as_str()), Role::Assistant);
        assert_eq!(Role::parse("anything else"), Role::User);
    }

    #[tokio::test]
    async fn create_seeds_system_message() {
        let store = SessionStore::new(4);
        let slot = store.get_or_create("s1", "be helpful").await;

        let state = slot.lock().await;
        assert_eq!(state.dialog.len(), 1);
        assert_eq!(state.dialog[0].role, Role::System);
        assert_eq!(state.dialog[0].content, "be helpful");
        assert_eq!(state.turn_count, 0);
        assert!(state.memory.is_none());
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = SessionStore::new(4);
        let first = store.get_or_create("s1", "prompt one").await;
        let second = store.get_or_create("s1", "prompt two").await;

        assert!(Arc::ptr_eq(&first, &second));
        // the existing dialog is untouched
        let state = second.lock().await;
        assert_eq!(state.dialog[0].content, "prompt one");
    }

    #[tokio::test]
    async fn ceiling_is_never_exceeded() {
        let store = SessionStore::new(3);
        for i in 0..10 {
            store.get_or_create(&format!("s{i}"), "sys").await;
        }
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn eviction_follows_last_access_order() {
        let store = SessionStore::new(2);
        store.get_or_create("a", "sys").await;
        store.get_or_create("b", "sys").await;

        // refresh a so b becomes least recently used
        assert!(store.touch("a").await);
        store.get_or_create("c", "sys").await;

        assert!(store.get("b").await.is_none());
        assert!(store.get("a").await.is_some());
        assert!(store.get("c").await.is_some());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn touch_needs_no_mutator_lock() {
        let store = SessionStore::new(2);
        let slot = store.get_or_create("s1", "sys").await;

        // hold the mutator lock while touching through the store
        let guard = slot.lock().await;
        assert!(store.touch("s1").await);
        drop(guard);

        assert!(!store.touch("ghost").await);
    }

    #[tokio::test]
    async fn clear_resets_dialog_and_memory() {
        let store = SessionStore::new(2);
        let slot = store.get_or_create("s1", "sys").await;
        {
            let mut state = slot.lock().await;
            state.dialog.push(DialogMessage::user("hello"));
            state.dialog.push(DialogMessage::assistant("hi"));
            state.turn_count = 1;
            state.memory = Some(MemoryState::default());
        }

        assert!(store.clear("s1").await);
        let state = slot.lock().await;
        assert_eq!(state.dialog.len(), 1);
        assert_eq!(state.dialog[0].role, Role::System);
        assert_eq!(state.turn_count, 0);
        assert!(state.memory.is_none());

        assert!(!store.clear("ghost").await);
    }

    #[tokio::test]
    async fn remove_drops_the_slot() {
        let store = SessionStore::new(2);
        store.get_or_create("s1", "sys").await;

        assert!(store.remove("s1").await);
        assert!(!store.remove("s1").await);
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn evicted_slot_writes_are_detached() {
        let store = SessionStore::new(1);
        let slot = store.get_or_create("a", "sys").await;
        store.get_or_create("b", "sys").await; // evicts a

        // a write against the evicted slot does not crash and stays invisible
        slot.lock().await.dialog.push(DialogMessage::user("late"));

        let fresh = store.get_or_create("a", "sys").await;
        assert!(!Arc::ptr_eq(&slot, &fresh));
        assert_eq!(fresh.lock().await.dialog.len(), 1);
    }
}
