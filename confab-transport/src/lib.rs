//! Confab Transport - Pub/sub transport layer for the confab workspace.
//!
//! This crate provides:
//! - The [`Transport`] trait with in-memory and Redis backends
//! - Topic grammar and reply-topic construction
//! - Wire envelope types and reply decoding

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod frame;
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;
pub mod topic;
pub mod traits;

pub use frame::{generate_request_id, ChatRequest, Frame, Reply};
pub use memory::InMemoryTransport;
#[cfg(feature = "redis-backend")]
pub use redis::RedisTransport;
pub use topic::{client_topic, parse_reply_topic, reply_pattern, reply_topic, ReplyAddress};
pub use traits::{
    create_transport, FrameReceiver, Transport, TransportError, TransportResult, TransportStatus,
};
