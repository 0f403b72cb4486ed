//! The chat-client boundary.
//!
//! The actual chat protocol (connect/reconnect/backoff, message
//! semantics) is not this crate's business. Workers drive whatever
//! implements `ChatClient`; tests drive a fake.

use std::future::Future;

/// Connection state as reported by the underlying client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closed,
}

/// Connection-lifecycle and traffic events, drained by the worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// A parsed chat message arrived (payload irrelevant to the cluster).
    Message,
    /// A raw protocol line arrived.
    RawMessage,
}

/// An opaque, connected chat client.
///
/// `join`/`part` resolve when the protocol operation completes;
/// `channels` and `ready_state` are cheap snapshots. `drain_events`
/// returns and clears events accumulated since the previous call, so the
/// worker loop can count traffic and notice disconnects without
/// subscribing to callbacks.
pub trait ChatClient: Send + Sync + 'static {
    fn join(&self, channel: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn part(&self, channel: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn channels(&self) -> Vec<String>;
    fn ready_state(&self) -> ReadyState;
    fn drain_events(&self) -> Vec<ClientEvent>;
}
