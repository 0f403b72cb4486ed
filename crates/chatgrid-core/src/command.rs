//! The queued command format.
//!
//! Commands are immutable once enqueued and serialized as JSON into the
//! shared store's lists. A command is consumed exactly once per dequeue
//! but may be re-enqueued, so delivery is at-least-once overall.

use serde::{Deserialize, Serialize};

/// The fixed set of actions the distributor can place on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Join,
    Part,
    CreateClient,
    DeleteClient,
}

impl CommandKind {
    /// Stable wire name, also used in pub/sub topic names.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Join => "join",
            CommandKind::Part => "part",
            CommandKind::CreateClient => "create_client",
            CommandKind::DeleteClient => "delete_client",
        }
    }
}

/// Payload carried by a command. Which fields are set depends on the kind:
/// channel actions carry `channel`, client actions carry `username` (and
/// optionally `password` plus the `channels` the client should join).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl CommandOptions {
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::default()
        }
    }

    pub fn client(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..Self::default()
        }
    }
}

/// A single queued command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Enqueue time, Unix epoch milliseconds.
    pub time: u64,
    pub kind: CommandKind,
    pub options: CommandOptions,
}

impl Command {
    pub fn new(kind: CommandKind, options: CommandOptions) -> Self {
        Self {
            time: crate::epoch_ms(),
            kind,
            options,
        }
    }
}
