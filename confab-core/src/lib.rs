//! Confab Core - Conversation layer over a pub/sub transport.
//!
//! This crate provides:
//! - [`ConversationService`], the ask entry point tying everything together
//! - Request/reply correlation with per-session FIFO fallback
//! - A bounded LRU [`SessionStore`] with per-session locking
//! - History trimming under message and token budgets
//! - Three-layer context compression with grid delta suppression

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod context;
pub mod correlate;
pub mod service;
pub mod session;
pub mod sink;
pub mod trim;

pub use context::{grid_hash, ContextMemory, MemoryState, TrackEvent, WorldState};
pub use correlate::{PendingRegistry, PendingTicket};
pub use service::{AskOptions, ConversationService, ServiceHealth};
pub use session::{DialogMessage, Role, SessionSlot, SessionState, SessionStore};
pub use sink::{MemorySink, TurnRecord, TurnSink};
pub use trim::{dialog_tokens, estimate_tokens, trim, trim_with, TrimPolicy};
