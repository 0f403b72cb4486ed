//! chatgrid-core — shared types for the ChatGrid cluster.
//!
//! Holds everything the other crates agree on: the immutable
//! `ClusterConfig` built once at startup, channel name handling, the
//! queued `Command` format, the closed cluster event vocabulary, and the
//! `ChatClient` boundary trait behind which the actual chat protocol
//! lives.

pub mod channel;
pub mod client;
pub mod command;
pub mod config;
pub mod event;

pub use channel::{channel_login, sanitize};
pub use client::{ChatClient, ClientEvent, ReadyState};
pub use command::{Command, CommandKind, CommandOptions};
pub use config::ClusterConfig;
pub use event::ClusterEvent;

/// Current Unix epoch in milliseconds.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Random lowercase-hex suffix for generated supervisor and worker ids.
///
/// Uniqueness matters here, cryptographic quality does not; the seeded
/// hasher state is random per call.
pub fn random_suffix(len: usize) -> String {
    use std::hash::{BuildHasher, Hasher, RandomState};

    let mut out = String::with_capacity(len);
    while out.len() < len {
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_u64(epoch_ms());
        out.push_str(&format!("{:016x}", hasher.finish()));
    }
    out.truncate(len);
    out
}
