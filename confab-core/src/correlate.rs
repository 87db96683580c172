//! Pending request correlation for pub/sub round trips.
//!
//! Every outbound request registers an entry here; the reply reader resolves
//! entries as frames arrive. An entry is indexed twice: by request id for
//! exact matches, and in a per-session FIFO queue for far ends that do not
//! echo the id. Both indexes are kept consistent under one lock, and every
//! way an entry can end (reply, timeout, cancellation, withdrawal) funnels
//! through the same removal, so an entry is completed at most once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use confab_common::{Error, Result};
use confab_transport::Reply;

/// Terminal outcome delivered to a waiting caller.
#[derive(Debug)]
enum Outcome {
    Reply(Reply),
    TimedOut,
    Cancelled,
}

struct PendingEntry {
    session_id: String,
    created_at: Instant,
    responder: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<String, PendingEntry>,
    by_session: HashMap<String, VecDeque<String>>,
}

impl RegistryInner {
    /// Remove an entry from both indexes.
    fn remove(&mut self, request_id: &str) -> Option<PendingEntry> {
        let entry = self.by_id.remove(request_id)?;
        if let Some(queue) = self.by_session.get_mut(&entry.session_id) {
            if let Some(pos) = queue.iter().position(|id| id == request_id) {
                queue.remove(pos);
            }
            if queue.is_empty() {
                self.by_session.remove(&entry.session_id);
            }
        }
        Some(entry)
    }
}

/// Registry for in-flight requests awaiting replies.
#[derive(Default)]
pub struct PendingRegistry {
    inner: Mutex<RegistryInner>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request and get an awaitable ticket.
    ///
    /// A timer task retires the entry with a timeout outcome when no reply
    /// arrives within `timeout`.
    pub async fn register(
        self: &Arc<Self>,
        request_id: impl Into<String>,
        session_id: impl Into<String>,
        timeout: Duration,
    ) -> PendingTicket {
        let request_id = request_id.into();
        let session_id = session_id.into();
        let (tx, rx) = oneshot::channel();

        {
            let mut inner = self.inner.lock().await;
            inner.by_id.insert(
                request_id.clone(),
                PendingEntry {
                    session_id: session_id.clone(),
                    created_at: Instant::now(),
                    responder: tx,
                },
            );
            inner
                .by_session
                .entry(session_id)
                .or_default()
                .push_back(request_id.clone());
        }

        let registry = Arc::clone(self);
        let timer_id = request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if registry.retire(&timer_id, Outcome::TimedOut).await {
                tracing::debug!(request_id = %timer_id, "Pending request timed out");
            }
        });

        PendingTicket {
            request_id,
            registry: Arc::clone(self),
            rx,
        }
    }

    /// Resolve a pending request with a reply.
    ///
    /// Resolution policy, in order:
    /// 1. exact `request_id` match;
    /// 2. otherwise pop the oldest entry from `session_id`'s FIFO queue.
    ///
    /// Returns false when neither key matches anything pending. With far
    /// ends that drop the id echo, interleaved replies for one session are
    /// attributed in issue order; that is best-effort and the reason the
    /// service serializes calls per session.
    pub async fn resolve(
        &self,
        request_id: Option<&str>,
        session_id: Option<&str>,
        reply: Reply,
    ) -> bool {
        let entry = {
            let mut inner = self.inner.lock().await;
            let target = match request_id {
                Some(id) if inner.by_id.contains_key(id) => Some(id.to_string()),
                _ => session_id.and_then(|sid| {
                    inner
                        .by_session
                        .get(sid)
                        .and_then(|queue| queue.front().cloned())
                }),
            };
            target.and_then(|id| inner.remove(&id))
        };

        match entry {
            Some(entry) => {
                tracing::debug!(
                    session_id = %entry.session_id,
                    waited_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Pending request resolved"
                );
                let _ = entry.responder.send(Outcome::Reply(reply));
                true
            }
            None => {
                tracing::debug!(
                    request_id = request_id.unwrap_or("-"),
                    session_id = session_id.unwrap_or("-"),
                    "Reply matched no pending request, dropped"
                );
                false
            }
        }
    }

    /// Cancel a pending request. The waiter observes a cancelled outcome,
    /// exactly like a timeout observes a timed-out one.
    pub async fn cancel(&self, request_id: &str) -> bool {
        self.retire(request_id, Outcome::Cancelled).await
    }

    /// Remove a pending request without completing it.
    ///
    /// Used when the publish that followed registration failed: the caller
    /// still holds the ticket and already knows the outcome, so nothing is
    /// sent through it.
    pub async fn withdraw(&self, request_id: &str) -> bool {
        self.inner.lock().await.remove(request_id).is_some()
    }

    /// Number of in-flight requests.
    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.by_id.len()
    }

    /// Number of in-flight requests for one session.
    pub async fn session_queue_len(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .by_session
            .get(session_id)
            .map_or(0, VecDeque::len)
    }

    async fn retire(&self, request_id: &str, outcome: Outcome) -> bool {
        let entry = self.inner.lock().await.remove(request_id);
        match entry {
            Some(entry) => {
                let _ = entry.responder.send(outcome);
                true
            }
            None => false,
        }
    }
}

/// Awaitable handle for one registered request.
pub struct PendingTicket {
    request_id: String,
    registry: Arc<PendingRegistry>,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingTicket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the outcome, observing `cancel` when supplied.
    ///
    /// Cancellation retires the registry entry and then reads the outcome
    /// from the same slot; a reply that wins the race is still returned.
    pub async fn wait(self, cancel: Option<&CancellationToken>) -> Result<Reply> {
        let PendingTicket {
            request_id,
            registry,
            mut rx,
        } = self;

        let outcome = match cancel {
            Some(token) => {
                tokio::select! {
                    outcome = &mut rx => outcome,
                    _ = token.cancelled() => {
                        registry.cancel(&request_id).await;
                        rx.await
                    }
                }
            }
            None => rx.await,
        };

        match outcome {
            Ok(Outcome::Reply(reply)) => Ok(reply),
            Ok(Outcome::TimedOut) => Err(Error::Timeout),
            Ok(Outcome::Cancelled) => Err(Error::Cancelled),
            Err(_) => Err(Error::Internal(
                "pending request dropped without an outcome".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_reply(text: &str) -> Reply {
        Reply::Text(text.to_string())
    }

    #[tokio::test]
    async fn resolve_by_request_id() {
        let registry = Arc::new(PendingRegistry::new());
        let ticket = registry
            .register("req-1", "sess-1", Duration::from_secs(5))
            .await;

        assert_eq!(registry.pending_count().await, 1);
        assert!(registry.resolve(Some("req-1"), None, text_reply("hi")).await);

        assert_eq!(ticket.wait(None).await.unwrap().into_text(), "hi");
        assert_eq!(registry.pending_count().await, 0);
        assert_eq!(registry.session_queue_len("sess-1").await, 0);
    }

    #[tokio::test]
    async fn resolve_at_most_once() {
        let registry = Arc::new(PendingRegistry::new());
        let _ticket = registry
            .register("req-1", "sess-1", Duration::from_secs(5))
            .await;

        assert!(registry.resolve(Some("req-1"), None, text_reply("first")).await);
        assert!(!registry.resolve(Some("req-1"), None, text_reply("second")).await);
        assert!(
            !registry
                .resolve(Some("req-1"), Some("sess-1"), text_reply("third"))
                .await
        );
    }

    #[tokio::test]
    async fn fifo_fallback_resolves_in_issue_order() {
        let registry = Arc::new(PendingRegistry::new());
        let first = registry
            .register("req-1", "sess-1", Duration::from_secs(5))
            .await;
        let second = registry
            .register("req-2", "sess-1", Duration::from_secs(5))
            .await;

        // untagged replies: session fallback pops oldest first
        assert!(registry.resolve(None, Some("sess-1"), text_reply("one")).await);
        assert!(registry.resolve(None, Some("sess-1"), text_reply("two")).await);

        assert_eq!(first.wait(None).await.unwrap().into_text(), "one");
        assert_eq!(second.wait(None).await.unwrap().into_text(), "two");
    }

    #[tokio::test]
    async fn unknown_request_id_falls_back_to_fifo() {
        let registry = Arc::new(PendingRegistry::new());
        let ticket = registry
            .register("req-1", "sess-1", Duration::from_secs(5))
            .await;

        assert!(
            registry
                .resolve(Some("expired-id"), Some("sess-1"), text_reply("late"))
                .await
        );
        assert_eq!(ticket.wait(None).await.unwrap().into_text(), "late");
    }

    #[tokio::test]
    async fn unmatched_reply_is_dropped() {
        let registry = Arc::new(PendingRegistry::new());
        assert!(!registry.resolve(Some("nope"), Some("ghost"), text_reply("x")).await);
    }

    #[tokio::test]
    async fn timeout_retires_entry_after_deadline() {
        let registry = Arc::new(PendingRegistry::new());
        let ticket = registry
            .register("req-1", "sess-1", Duration::from_millis(100))
            .await;

        let started = Instant::now();
        let err = ticket.wait(None).await.unwrap_err();

        assert!(matches!(err, Error::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(registry.pending_count().await, 0);
        assert_eq!(registry.session_queue_len("sess-1").await, 0);
    }

    #[tokio::test]
    async fn cancel_is_symmetric_with_timeout() {
        let registry = Arc::new(PendingRegistry::new());
        let ticket = registry
            .register("req-1", "sess-1", Duration::from_secs(30))
            .await;

        assert!(registry.cancel("req-1").await);
        assert!(matches!(ticket.wait(None).await.unwrap_err(), Error::Cancelled));
        assert_eq!(registry.pending_count().await, 0);

        // a reply for the cancelled request is now unmatched
        assert!(!registry.resolve(Some("req-1"), None, text_reply("late")).await);
    }

    #[tokio::test]
    async fn cancellation_token_retires_entry() {
        let registry = Arc::new(PendingRegistry::new());
        let ticket = registry
            .register("req-1", "sess-1", Duration::from_secs(30))
            .await;

        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { ticket.wait(Some(&token)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(registry.pending_count().await, 0);
    }

    #[tokio::test]
    async fn withdraw_leaves_no_trace() {
        let registry = Arc::new(PendingRegistry::new());
        let ticket = registry
            .register("req-1", "sess-1", Duration::from_secs(30))
            .await;

        assert!(registry.withdraw("req-1").await);
        assert!(!registry.withdraw("req-1").await);
        assert_eq!(registry.pending_count().await, 0);
        assert_eq!(registry.session_queue_len("sess-1").await, 0);

        drop(ticket);

        // nothing left to resolve
        assert!(!registry.resolve(Some("req-1"), Some("sess-1"), text_reply("x")).await);
    }

    #[tokio::test]
    async fn concurrent_resolution_across_sessions() {
        let registry = Arc::new(PendingRegistry::new());
        let t1 = registry
            .register("req-a", "sess-a", Duration::from_secs(5))
            .await;
        let t2 = registry
            .register("req-b", "sess-b", Duration::from_secs(5))
            .await;

        let r1 = registry.clone();
        let r2 = registry.clone();
        let (ok1, ok2) = tokio::join!(
            async move { r1.resolve(Some("req-a"), None, text_reply("alpha")).await },
            async move { r2.resolve(Some("req-b"), None, text_reply("beta")).await }
        );

        assert!(ok1);
        assert!(ok2);
        assert_eq!(t1.wait(None).await.unwrap().into_text(), "alpha");
        assert_eq!(t2.wait(None).await.unwrap().into_text(), "beta");
    }
}
