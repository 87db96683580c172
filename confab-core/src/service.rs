//! Conversation service over a pub/sub transport.
//!
//! Handles the complete turn flow:
//! 1. Load or create the session and take its lock
//! 2. Append the user turn and trim history to budget
//! 3. Publish the request and register the pending correlation
//! 4. Await the reply, a timeout, or cancellation
//! 5. Append the assistant turn and persist both best-effort
//!
//! A call ends in exactly one of: resolved with reply text, timed out,
//! cancelled, or failed fast because the transport was down. Publish
//! failure withdraws the pending entry and rolls back the user turn, so
//! a retry does not duplicate it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use confab_common::{Config, Metrics, MetricsSummary, Result};
use confab_transport::{
    client_topic, create_transport, generate_request_id, parse_reply_topic, reply_pattern,
    reply_topic, ChatRequest, Frame, FrameReceiver, Reply, Transport, TransportStatus,
};

use crate::context::{ContextMemory, MemoryState, TrackEvent, WorldState};
use crate::correlate::PendingRegistry;
use crate::session::{DialogMessage, Role, SessionStore};
use crate::sink::TurnSink;
use crate::trim::{trim, TrimPolicy};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    /// Override the configured reply timeout
    pub timeout: Option<Duration>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Resend the static context layer even past the first turn
    pub refresh_static: bool,
}

/// Liveness snapshot for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub transport: TransportStatus,
    pub resident_sessions: usize,
    pub pending_requests: usize,
}

/// Ties transport, correlation, sessions, trimming, and context memory
/// into a single ask call.
pub struct ConversationService {
    transport: Arc<dyn Transport>,
    registry: Arc<PendingRegistry>,
    sessions: Arc<SessionStore>,
    context: ContextMemory,
    sink: Option<Arc<dyn TurnSink>>,
    metrics: Metrics,
    config: Config,
    readers: Vec<JoinHandle<()>>,
}

impl ConversationService {
    /// Create the transport from config and start the service.
    pub async fn start(config: Config) -> Result<Self> {
        let transport = create_transport(&config.transport).await?;
        Self::start_with_transport(config, transport).await
    }

    /// Start the service on an existing transport.
    ///
    /// Subscribes the reply readers before returning, so no reply can
    /// arrive unobserved once the first ask goes out.
    pub async fn start_with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let registry = Arc::new(PendingRegistry::new());
        let sessions = Arc::new(SessionStore::new(config.session.max_sessions));
        let context = ContextMemory::new(config.memory.clone());

        let prefix = &config.transport.reply_prefix;
        let client_id = &config.transport.client_id;
        let mut readers = Vec::with_capacity(2);
        for pattern in [
            // per-request topics, for far ends that honor replyTopic
            reply_pattern(prefix, client_id),
            // shared per-client topic, correlated through the payload
            client_topic(prefix, client_id),
        ] {
            let rx = transport.subscribe(&pattern).await?;
            readers.push(Self::spawn_reader(
                rx,
                Arc::clone(&registry),
                prefix.clone(),
                client_id.clone(),
            ));
        }

        tracing::info!(
            transport = transport.name(),
            client_id = %client_id,
            "Conversation service started"
        );

        Ok(Self {
            transport,
            registry,
            sessions,
            context,
            sink: None,
            metrics: Metrics::new(),
            config,
            readers,
        })
    }

    /// Attach a persistence sink for resolved turns.
    pub fn with_sink(mut self, sink: Arc<dyn TurnSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set the capability listing for the static context layer.
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.context = self.context.clone().with_capabilities(capabilities);
        self
    }

    /// Forward inbound frames to the registry.
    ///
    /// Decoding and resolution are cheap map operations; anything heavier
    /// belongs on the caller side of the awaited ticket, never here.
    fn spawn_reader(
        mut rx: FrameReceiver,
        registry: Arc<PendingRegistry>,
        reply_prefix: String,
        client_id: String,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let address = parse_reply_topic(&reply_prefix, &client_id, &frame.topic);
                let reply = Reply::decode(&frame.payload);

                // topic addressing wins over whatever the payload echoes
                let request_id = address
                    .as_ref()
                    .map(|a| a.request_id.clone())
                    .or_else(|| reply.request_id().map(str::to_string));
                let session_id = address
                    .as_ref()
                    .map(|a| a.session_id.clone())
                    .or_else(|| reply.session_id().map(str::to_string));

                registry
                    .resolve(request_id.as_deref(), session_id.as_deref(), reply)
                    .await;
            }
            tracing::debug!("Reply reader stopped");
        })
    }

    /// One conversation turn: returns the far end's reply text.
    pub async fn ask(
        &self,
        session_id: &str,
        user_text: &str,
        system_prompt: &str,
        options: &AskOptions,
    ) -> Result<String> {
        self.ask_inner(session_id, user_text, system_prompt, None, options, None)
            .await
    }

    /// Like [`ask`](Self::ask), aborted early when the token fires.
    pub async fn ask_cancellable(
        &self,
        session_id: &str,
        user_text: &str,
        system_prompt: &str,
        options: &AskOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.ask_inner(
            session_id,
            user_text,
            system_prompt,
            None,
            options,
            Some(cancel),
        )
        .await
    }

    /// A turn carrying structured world state through context memory.
    ///
    /// The composed working and episodic layers are prepended to the user
    /// text; the static layer rides in the request's system prompt on the
    /// session's first turn only.
    pub async fn ask_in_world(
        &self,
        session_id: &str,
        user_text: &str,
        system_prompt: &str,
        world: &WorldState,
        options: &AskOptions,
    ) -> Result<String> {
        self.ask_inner(session_id, user_text, system_prompt, Some(world), options, None)
            .await
    }

    async fn ask_inner(
        &self,
        session_id: &str,
        user_text: &str,
        system_prompt: &str,
        world: Option<&WorldState>,
        options: &AskOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<String> {
        let started = Instant::now();
        let result = self
            .run_turn(session_id, user_text, system_prompt, world, options, cancel)
            .await;
        self.metrics
            .record_request(started.elapsed().as_millis() as u64, result.is_ok())
            .await;
        result
    }

    async fn run_turn(
        &self,
        session_id: &str,
        user_text: &str,
        system_prompt: &str,
        world: Option<&WorldState>,
        options: &AskOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<String> {
        let slot = self.sessions.get_or_create(session_id, system_prompt).await;
        // held across the whole turn so per-session turns serialize
        let mut state = slot.lock().await;

        let (wire_system, message) = match world {
            Some(world) => {
                let memory = state.memory.get_or_insert_with(MemoryState::default);
                let (static_layer, context_text) =
                    self.context
                        .compose(memory, world, system_prompt, options.refresh_static);
                let message = if context_text.is_empty() {
                    user_text.to_string()
                } else {
                    format!("{context_text}\n{user_text}")
                };
                (static_layer, message)
            }
            None => {
                let wire_system = if system_prompt.is_empty() {
                    None
                } else {
                    Some(system_prompt.to_string())
                };
                (wire_system, user_text.to_string())
            }
        };

        state.dialog.push(DialogMessage::user(message.clone()));
        let policy = TrimPolicy::from_config(&self.config.session);
        state.dialog = trim(std::mem::take(&mut state.dialog), &policy);

        let request_id = generate_request_id();
        let reply_to = reply_topic(
            &self.config.transport.reply_prefix,
            session_id,
            &self.config.transport.client_id,
            &request_id,
        );
        let request = ChatRequest {
            session_id: session_id.to_string(),
            message: message.clone(),
            system_prompt: wire_system,
            request_id: request_id.clone(),
            reply_topic: reply_to,
            client_id: self.config.transport.client_id.clone(),
            temperature: options.temperature.or(self.config.call.temperature),
            top_p: options.top_p.or(self.config.call.top_p),
            max_tokens: options.max_tokens.or(self.config.call.max_tokens),
        };
        let Frame { topic, payload } = request.into_frame(&self.config.transport.request_topic)?;

        let timeout = options
            .timeout
            .unwrap_or(Duration::from_millis(self.config.call.timeout_ms));
        // registered before publish so an instant reply cannot slip past;
        // withdrawn below if the publish never happens
        let ticket = self
            .registry
            .register(&request_id, session_id, timeout)
            .await;

        if let Err(e) = self.transport.publish(&topic, payload).await {
            self.registry.withdraw(&request_id).await;
            if state.dialog.last().is_some_and(|m| m.role == Role::User) {
                state.dialog.pop();
            }
            tracing::warn!(
                session_id = %session_id,
                request_id = %request_id,
                error = %e,
                "Publish failed, call aborted"
            );
            return Err(e.into());
        }

        tracing::debug!(
            session_id = %session_id,
            request_id = %request_id,
            "Request published, awaiting reply"
        );

        let reply = ticket.wait(cancel).await?;
        if reply.text().is_none() {
            tracing::warn!(
                session_id = %session_id,
                request_id = %request_id,
                "Reply carried no recognized text field, degrading to raw payload"
            );
        }
        let reply_text = reply.into_text();

        state.dialog.push(DialogMessage::assistant(reply_text.clone()));
        state.turn_count += 1;
        drop(state);

        self.persist_pair(session_id, &message, &reply_text, &request_id)
            .await;

        Ok(reply_text)
    }

    /// Best-effort persistence; failures are logged, never surfaced.
    async fn persist_pair(
        &self,
        session_id: &str,
        user_text: &str,
        reply_text: &str,
        request_id: &str,
    ) {
        let Some(sink) = &self.sink else {
            return;
        };
        let metadata = serde_json::json!({ "requestId": request_id });
        for (role, text) in [(Role::User, user_text), (Role::Assistant, reply_text)] {
            if let Err(e) = sink
                .persist_turn(session_id, role, text, Some(metadata.clone()))
                .await
            {
                tracing::warn!(
                    session_id = %session_id,
                    sink = sink.name(),
                    error = %e,
                    "Turn persistence failed, continuing"
                );
            }
        }
    }

    /// Record a world event into the session's episodic ring.
    ///
    /// Events for unknown sessions are dropped.
    pub async fn observe(&self, session_id: &str, event: TrackEvent) -> bool {
        let Some(slot) = self.sessions.get(session_id).await else {
            tracing::debug!(session_id = %session_id, "Event for missing session dropped");
            return false;
        };
        let mut state = slot.lock().await;
        let memory = state.memory.get_or_insert_with(MemoryState::default);
        self.context.observe(memory, event);
        true
    }

    /// Reset a session's dialog and context memory, keeping it resident.
    pub async fn clear_session(&self, session_id: &str) -> bool {
        self.sessions.clear(session_id).await
    }

    /// Drop a session entirely.
    pub async fn delete_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).await
    }

    /// Snapshot of a session's dialog; empty for unknown sessions.
    pub async fn dialog(&self, session_id: &str) -> Vec<DialogMessage> {
        match self.sessions.get(session_id).await {
            Some(slot) => slot.lock().await.dialog.clone(),
            None => Vec::new(),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.len().await
    }

    pub async fn pending_count(&self) -> usize {
        self.registry.pending_count().await
    }

    pub async fn health(&self) -> ServiceHealth {
        ServiceHealth {
            transport: self.transport.status(),
            resident_sessions: self.sessions.len().await,
            pending_requests: self.registry.pending_count().await,
        }
    }

    pub async fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.summary().await
    }

    /// Stop the reply readers and close the transport.
    pub async fn shutdown(&self) -> Result<()> {
        for reader in &self.readers {
            reader.abort();
        }
        self.transport.close().await?;
        tracing::info!("Conversation service stopped");
        Ok(())
    }
}

impl Drop for ConversationService {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}
