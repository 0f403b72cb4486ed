//! Placement view and queue shaping.
//!
//! A drain's worth of commands is deduplicated last-writer-wins per
//! channel (and per username for client commands) before anything is
//! placed: a PART queued after a JOIN for the same channel supersedes
//! it, and vice versa. Placement itself works on [`WorkerView`]s, an
//! in-memory projection of the persisted worker rows whose counters are
//! updated as commands are handed out, so one drain never places the
//! same channel twice.

use std::collections::HashMap;

use chatgrid_core::{Command, CommandKind, sanitize};
use chatgrid_state::{WorkerId, WorkerRecord};

/// One worker's standing in the placement view.
#[derive(Debug, Clone)]
pub struct WorkerView {
    pub id: WorkerId,
    pub channels: Vec<String>,
    pub clients: Vec<String>,
}

impl WorkerView {
    pub fn from_record(record: &WorkerRecord) -> Self {
        Self {
            id: record.id.clone(),
            channels: record.channels.iter().map(|c| sanitize(c)).collect(),
            clients: record.clients.clone(),
        }
    }

    pub fn channel_sum(&self) -> usize {
        self.channels.len()
    }

    pub fn client_sum(&self) -> usize {
        self.clients.len()
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    pub fn hosts_client(&self, username: &str) -> bool {
        self.clients.iter().any(|u| u == username)
    }
}

/// Collapse one drain to its final intent: the latest command per
/// channel (or per username) wins, keeping the position of the first
/// occurrence. Commands without a channel or username pass through.
pub fn dedupe(commands: Vec<Command>) -> Vec<Command> {
    let mut out: Vec<Command> = Vec::with_capacity(commands.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for command in commands {
        let key = match command.kind {
            CommandKind::Join | CommandKind::Part => command
                .options
                .channel
                .as_deref()
                .map(|c| format!("channel:{}", sanitize(c))),
            CommandKind::CreateClient | CommandKind::DeleteClient => command
                .options
                .username
                .as_deref()
                .map(|u| format!("client:{u}")),
        };
        match key {
            Some(key) => match positions.get(&key) {
                Some(&at) => out[at] = command,
                None => {
                    positions.insert(key, out.len());
                    out.push(command);
                }
            },
            // No addressable subject; nothing to collapse against.
            None => out.push(command),
        }
    }
    out
}

/// Split a deduplicated drain into the channel queue (join/part) and
/// the client queue (create/delete client).
pub fn split(commands: Vec<Command>) -> (Vec<Command>, Vec<Command>) {
    commands.into_iter().partition(|c| {
        matches!(c.kind, CommandKind::Join | CommandKind::Part)
    })
}

/// The worker carrying the fewest channels; ties broken by order.
pub fn least_loaded_by_channels(workers: &mut [WorkerView]) -> Option<&mut WorkerView> {
    workers.iter_mut().min_by_key(|w| w.channel_sum())
}

/// The worker hosting the fewest secondary clients.
pub fn least_loaded_by_clients(workers: &mut [WorkerView]) -> Option<&mut WorkerView> {
    workers.iter_mut().min_by_key(|w| w.client_sum())
}

/// The worker currently holding a channel, if any.
pub fn holder_of<'a>(workers: &'a mut [WorkerView], channel: &str) -> Option<&'a mut WorkerView> {
    workers.iter_mut().find(|w| w.is_joined(channel))
}

/// The worker currently hosting a client username, if any.
pub fn host_of<'a>(workers: &'a mut [WorkerView], username: &str) -> Option<&'a mut WorkerView> {
    workers.iter_mut().find(|w| w.hosts_client(username))
}

/// Where a client command lands: the worker already hosting the
/// username (it joins any new channels with the existing client),
/// otherwise the worker hosting the fewest clients.
pub fn client_target<'a>(
    workers: &'a mut [WorkerView],
    username: &str,
) -> Option<&'a mut WorkerView> {
    match workers.iter().position(|w| w.hosts_client(username)) {
        Some(at) => workers.get_mut(at),
        None => least_loaded_by_clients(workers),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgrid_core::CommandOptions;

    fn join(channel: &str) -> Command {
        Command::new(CommandKind::Join, CommandOptions::channel(channel))
    }

    fn part(channel: &str) -> Command {
        Command::new(CommandKind::Part, CommandOptions::channel(channel))
    }

    #[test]
    fn later_part_cancels_earlier_join() {
        let out = dedupe(vec![join("#a"), part("#a")]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, CommandKind::Part);
    }

    #[test]
    fn later_join_cancels_earlier_part() {
        let out = dedupe(vec![part("#a"), join("#a")]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, CommandKind::Join);
    }

    #[test]
    fn dedupe_matches_unsanitized_spellings() {
        // "#A" and "a" are the same channel after sanitization.
        let out = dedupe(vec![join("#A"), part("a")]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, CommandKind::Part);
    }

    #[test]
    fn dedupe_keeps_first_position() {
        let out = dedupe(vec![join("#a"), join("#b"), part("#a")]);
        assert_eq!(out.len(), 2);
        // #a keeps its original slot but carries the later intent.
        assert_eq!(out[0].kind, CommandKind::Part);
        assert_eq!(out[0].options.channel.as_deref(), Some("#a"));
        assert_eq!(out[1].options.channel.as_deref(), Some("#b"));
    }

    #[test]
    fn dedupe_is_independent_per_subject() {
        let create = Command::new(CommandKind::CreateClient, CommandOptions::client("bot"));
        let delete = Command::new(CommandKind::DeleteClient, CommandOptions::client("bot"));
        let out = dedupe(vec![create, join("#a"), delete]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, CommandKind::DeleteClient);
        assert_eq!(out[1].kind, CommandKind::Join);
    }

    #[test]
    fn split_partitions_by_kind() {
        let create = Command::new(CommandKind::CreateClient, CommandOptions::client("bot"));
        let (channels, clients) = split(vec![join("#a"), create, part("#b")]);
        assert_eq!(channels.len(), 2);
        assert_eq!(clients.len(), 1);
    }

    fn view(id: &str, channels: &[&str]) -> WorkerView {
        WorkerView {
            id: id.to_string(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            clients: Vec::new(),
        }
    }

    #[test]
    fn least_loaded_picks_smallest_sum() {
        let mut workers = vec![
            view("w1", &["#1", "#2", "#3", "#4", "#5"]),
            view("w2", &["#6", "#7"]),
            view("w3", &["#8", "#9", "#10", "#11", "#12", "#13", "#14", "#15"]),
        ];
        assert_eq!(least_loaded_by_channels(&mut workers).unwrap().id, "w2");
    }

    #[test]
    fn holder_lookup() {
        let mut workers = vec![view("w1", &["#a"]), view("w2", &["#b"])];
        assert_eq!(holder_of(&mut workers, "#b").unwrap().id, "w2");
        assert!(holder_of(&mut workers, "#c").is_none());
    }

    #[test]
    fn client_target_prefers_the_hosting_worker() {
        let mut workers = vec![view("w1", &[]), view("w2", &[])];
        workers[1].clients = vec!["bot".to_string()];
        // w1 hosts fewer clients, but the username is pinned to w2.
        assert_eq!(client_target(&mut workers, "bot").unwrap().id, "w2");
        assert_eq!(client_target(&mut workers, "newbot").unwrap().id, "w1");
    }
}
