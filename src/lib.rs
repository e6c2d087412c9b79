//! Streaming roleplay chat relay.
//!
//! The server half ([`relay`], [`web`]) takes a conversation plus a persona id,
//! prepends the persona's system prompt and forwards the request to a hosted
//! chat-completion model, streaming the event stream straight back. The client
//! half ([`client`], [`consumer`], [`sse`], [`session`]) consumes that stream
//! incrementally and keeps per-conversation history.

pub mod characters;
pub mod cli;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod providers;
pub mod relay;
pub mod repl;
pub mod session;
pub mod sse;
pub mod web;

pub use client::{Cooldown, RelayClient};
pub use config::{ClientConfig, RelayConfig};
pub use error::{RelayError, Result};
pub use providers::{ChatMessage, RelayRequest, Role};
pub use relay::Relay;
pub use session::{ChatSession, ExchangeState, InMemoryMessageStore, MessageStore};
pub use sse::{SseFrame, SseParser};
