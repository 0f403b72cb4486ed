//! The channel distributor.
//!
//! One distributor runs per supervisor replica. Producers push join and
//! part requests onto the shared queue from anywhere; on each tick the
//! replica that wins the `handle-queue` lease drains the queue, shapes
//! it (dedupe, multi-client resolution), and places every command on a
//! live worker in rate-limited batches. A replica that loses the lease
//! simply skips the tick.
//!
//! The distributor is also where crash recovery happens: the stale
//! sweep deletes rows whose writer stopped heartbeating and turns their
//! channels back into priority joins on the shared queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use chatgrid_broker::{
    CommandQueue, DistributedLock, PROCESS_STALED_KEY, RateLimiter, SHARE_QUEUE,
    SharedRateLimiter, SharedStore, input_queue,
};
use chatgrid_core::channel::{channel_login, sanitize_all};
use chatgrid_core::{
    ClusterConfig, ClusterEvent, Command, CommandKind, CommandOptions, epoch_ms, sanitize,
};
use chatgrid_state::{ChannelClient, ClusterStore};

use crate::delivery::Delivery;
use crate::error::DistributorResult;
use crate::placement::{self, WorkerView};

/// Lease serializing shared-queue draining across replicas.
pub const HANDLE_QUEUE_LOCK: &str = "handle-queue";

/// Lease serializing the stale sweep across replicas.
pub const RELEASE_SUPERVISORS_LOCK: &str = "release-supervisors";

/// Sweep lease; left to expire, which paces sweeps cluster-wide.
const RELEASE_LEASE_MS: u64 = 30_000;

const TERMINATE_POLL_MS: u64 = 25;

pub struct ChannelDistributor<S: SharedStore, D: Delivery> {
    config: Arc<ClusterConfig>,
    store: ClusterStore,
    broker: S,
    queue: CommandQueue<S>,
    lock: DistributedLock<S>,
    delivery: D,
    join_budget: SharedRateLimiter<S>,
    client_budget: SharedRateLimiter<S>,
    events: broadcast::Sender<ClusterEvent>,
    executing: AtomicBool,
    terminated: AtomicBool,
}

impl<S: SharedStore, D: Delivery> ChannelDistributor<S, D> {
    pub fn new(
        config: Arc<ClusterConfig>,
        store: ClusterStore,
        broker: S,
        delivery: D,
        events: broadcast::Sender<ClusterEvent>,
    ) -> Self {
        let join_budget = SharedRateLimiter::new(
            broker.clone(),
            "join",
            config.throttle.join.allow,
            Duration::from_millis(config.throttle.join.every_ms),
        );
        let client_budget = SharedRateLimiter::new(
            broker.clone(),
            "clients",
            config.throttle.clients.allow,
            Duration::from_millis(config.throttle.clients.every_ms),
        );
        Self {
            queue: CommandQueue::new(broker.clone()),
            lock: DistributedLock::new(broker.clone()),
            join_budget,
            client_budget,
            config,
            store,
            broker,
            delivery,
            events,
            executing: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    // ── Producer API ───────────────────────────────────────────────

    /// Request a channel join. Picked up on the next drain.
    pub async fn join(&self, channel: &str) -> DistributorResult<()> {
        self.queue
            .push(SHARE_QUEUE, CommandKind::Join, CommandOptions::channel(sanitize(channel)))
            .await?;
        Ok(())
    }

    /// Request a join ahead of everything already queued.
    pub async fn join_now(&self, channel: &str) -> DistributorResult<()> {
        self.queue
            .unshift(SHARE_QUEUE, CommandKind::Join, CommandOptions::channel(sanitize(channel)))
            .await?;
        Ok(())
    }

    /// Request a channel part.
    pub async fn part(&self, channel: &str) -> DistributorResult<()> {
        self.queue
            .push(SHARE_QUEUE, CommandKind::Part, CommandOptions::channel(sanitize(channel)))
            .await?;
        Ok(())
    }

    /// Request a dedicated client for a set of channels. The channels
    /// are registered so later joins route to this client.
    pub async fn create_client(
        &self,
        username: &str,
        password: &str,
        channels: &[String],
    ) -> DistributorResult<()> {
        let channels = sanitize_all(channels);
        for channel in &channels {
            self.store.put_channel_client(&ChannelClient {
                channel_login: channel_login(channel),
                username: username.to_string(),
                password: password.to_string(),
            })?;
        }
        let options = CommandOptions {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            channels,
            channel: None,
        };
        self.queue
            .push(SHARE_QUEUE, CommandKind::CreateClient, options)
            .await?;
        Ok(())
    }

    /// Request teardown of a dedicated client, dropping its channel
    /// registrations.
    pub async fn delete_client(&self, username: &str) -> DistributorResult<()> {
        self.store.delete_channel_clients_for(username)?;
        self.queue
            .push(SHARE_QUEUE, CommandKind::DeleteClient, CommandOptions::client(username))
            .await?;
        Ok(())
    }

    // ── Queue execution ────────────────────────────────────────────

    /// Drain and place the shared queue, if this replica wins the lease.
    pub async fn execute_queue(&self) -> DistributorResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(());
        }
        // The lease TTL tracks the tick interval, so an idle drain only
        // holds the queue for one tick.
        let lease_ms = self.config.supervisor.update_interval_ms;
        if !self.lock.lock(HANDLE_QUEUE_LOCK, lease_ms).await? {
            debug!("handle-queue lease held elsewhere, skipping drain");
            return Ok(());
        }
        if self.executing.swap(true, Ordering::SeqCst) {
            self.lock.release(HANDLE_QUEUE_LOCK).await?;
            return Ok(());
        }
        let result = self.run_queue().await;
        self.executing.store(false, Ordering::SeqCst);
        result
    }

    async fn run_queue(&self) -> DistributorResult<()> {
        let drained = self.queue.pending(SHARE_QUEUE).await?;
        if drained.is_empty() {
            // Nothing to do; the lease is left to expire.
            return Ok(());
        }

        let commands = placement::dedupe(drained);
        let (channel_commands, client_commands) = self.resolve(placement::split(commands))?;

        let records = self
            .store
            .list_open_workers(epoch_ms(), self.config.process.stale_secs)?;
        if records.is_empty() {
            warn!(
                pending = channel_commands.len() + client_commands.len(),
                "no open workers, re-queueing drain"
            );
            self.requeue_front(&client_commands).await?;
            self.requeue_front(&channel_commands).await?;
            return Ok(());
        }
        let mut workers: Vec<WorkerView> = records.iter().map(WorkerView::from_record).collect();

        self.run_batches(
            &mut workers,
            channel_commands,
            &self.join_budget,
            self.config.throttle.join.take,
            "join",
        )
        .await?;
        self.run_batches(
            &mut workers,
            client_commands,
            &self.client_budget,
            self.config.throttle.clients.take,
            "clients",
        )
        .await?;
        // Both batches done; hand the queue back instead of letting the
        // lease run out, so the next tick can drain immediately.
        self.lock.release(HANDLE_QUEUE_LOCK).await?;
        Ok(())
    }

    /// Fold joins for channels with a dedicated-client registration into
    /// the client queue: those channels run under a secondary identity
    /// instead of a worker's main client.
    fn resolve(
        &self,
        (mut channel_commands, mut client_commands): (Vec<Command>, Vec<Command>),
    ) -> DistributorResult<(Vec<Command>, Vec<Command>)> {
        if !self.config.multi_clients.enabled {
            return Ok((channel_commands, client_commands));
        }
        let logins: Vec<String> = channel_commands
            .iter()
            .filter(|c| c.kind == CommandKind::Join)
            .filter_map(|c| c.options.channel.as_deref().map(channel_login))
            .collect();
        let registered = self.store.channel_clients_for(&logins)?;
        if registered.is_empty() {
            return Ok((channel_commands, client_commands));
        }

        channel_commands.retain(|command| {
            if command.kind != CommandKind::Join {
                return true;
            }
            let Some(channel) = command.options.channel.as_deref() else {
                return true;
            };
            let login = channel_login(channel);
            let Some(registration) = registered.iter().find(|r| r.channel_login == login) else {
                return true;
            };
            debug!(%channel, username = %registration.username, "routing join to dedicated client");
            client_commands.push(Command {
                time: command.time,
                kind: CommandKind::CreateClient,
                options: CommandOptions {
                    channel: None,
                    channels: vec![sanitize(channel)],
                    username: Some(registration.username.clone()),
                    password: Some(registration.password.clone()),
                },
            });
            false
        });
        Ok((channel_commands, client_commands))
    }

    async fn run_batches(
        &self,
        workers: &mut Vec<WorkerView>,
        commands: Vec<Command>,
        budget: &SharedRateLimiter<S>,
        take: usize,
        budget_name: &str,
    ) -> DistributorResult<()> {
        let take = if take == 0 {
            debug!(budget = budget_name, "batch size of 0 raised to 1");
            1
        } else {
            take
        };
        let mut commands: VecDeque<Command> = commands.into();
        while !commands.is_empty() {
            if self.terminated.load(Ordering::SeqCst) {
                info!(remaining = commands.len(), "terminating, re-queueing remainder");
                return self.requeue_front(&commands).await;
            }

            let remaining = budget.remaining().await?;
            if remaining == 0 {
                warn!(budget = budget_name, held = commands.len(), "rate budget exhausted");
                let _ = self.events.send(ClusterEvent::RateLimited {
                    budget: budget_name.to_string(),
                });
                return self.requeue_front(&commands).await;
            }

            let batch = take.min(remaining as usize).min(commands.len());
            let mut placed = 0u32;
            for _ in 0..batch {
                let Some(command) = commands.pop_front() else {
                    break;
                };
                if self.place(workers, command).await? {
                    placed += 1;
                }
            }
            if placed > 0 {
                budget.decrement(placed).await?;
            }
            // Keep the lease alive across slow batches.
            self.lock
                .block(HANDLE_QUEUE_LOCK, self.config.supervisor.update_interval_ms)
                .await?;
        }
        Ok(())
    }

    /// Place one command. Returns true iff a delivery went out (and so
    /// consumed budget). Skips are silent; unacknowledged deliveries go
    /// back to the front of the shared queue.
    async fn place(
        &self,
        workers: &mut Vec<WorkerView>,
        command: Command,
    ) -> DistributorResult<bool> {
        match command.kind {
            CommandKind::Join => {
                let Some(channel) = command.options.channel.as_deref().map(sanitize) else {
                    return Ok(false);
                };
                if workers.iter().any(|w| w.is_joined(&channel)) {
                    debug!(%channel, "already assigned, skipping join");
                    return Ok(false);
                }
                let Some(worker) = placement::least_loaded_by_channels(workers) else {
                    return Ok(false);
                };
                let worker_id = worker.id.clone();
                if self.delivery.deliver(&worker_id, &command).await? {
                    worker.channels.push(channel);
                    Ok(true)
                } else {
                    self.queue.unshift_command(SHARE_QUEUE, &command).await?;
                    Ok(false)
                }
            }
            CommandKind::Part => {
                let Some(channel) = command.options.channel.as_deref().map(sanitize) else {
                    return Ok(false);
                };
                let Some(worker) = placement::holder_of(workers, &channel) else {
                    debug!(%channel, "part of unassigned channel, dropping");
                    return Ok(false);
                };
                let worker_id = worker.id.clone();
                if self.delivery.deliver(&worker_id, &command).await? {
                    worker.channels.retain(|c| c != &channel);
                    Ok(true)
                } else {
                    self.queue.unshift_command(SHARE_QUEUE, &command).await?;
                    Ok(false)
                }
            }
            CommandKind::CreateClient => {
                let Some(username) = command.options.username.clone() else {
                    return Ok(false);
                };
                // An already-hosted client still receives the command:
                // its worker joins the new channels with it.
                let Some(worker) = placement::client_target(workers, &username) else {
                    return Ok(false);
                };
                let worker_id = worker.id.clone();
                if self.delivery.deliver(&worker_id, &command).await? {
                    if !worker.hosts_client(&username) {
                        worker.clients.push(username);
                    }
                    for channel in &command.options.channels {
                        let channel = sanitize(channel);
                        if !worker.is_joined(&channel) {
                            worker.channels.push(channel);
                        }
                    }
                    Ok(true)
                } else {
                    self.queue.unshift_command(SHARE_QUEUE, &command).await?;
                    Ok(false)
                }
            }
            CommandKind::DeleteClient => {
                let Some(username) = command.options.username.clone() else {
                    return Ok(false);
                };
                let Some(worker) = placement::host_of(workers, &username) else {
                    return Ok(false);
                };
                let worker_id = worker.id.clone();
                if self.delivery.deliver(&worker_id, &command).await? {
                    worker.clients.retain(|u| u != &username);
                    Ok(true)
                } else {
                    self.queue.unshift_command(SHARE_QUEUE, &command).await?;
                    Ok(false)
                }
            }
        }
    }

    async fn requeue_front<'a, I>(&self, commands: I) -> DistributorResult<()>
    where
        I: IntoIterator<Item = &'a Command>,
        I::IntoIter: DoubleEndedIterator,
    {
        for command in commands.into_iter().rev() {
            self.queue.unshift_command(SHARE_QUEUE, command).await?;
        }
        Ok(())
    }

    // ── Stale reconciliation ───────────────────────────────────────

    /// Sweep rows whose writer stopped heartbeating. Normally gated by
    /// the `release-supervisors` lease (one replica per lease window);
    /// `force`, or a pending `process-staled` flag left by a worker that
    /// terminated on purpose, bypasses the gate.
    pub async fn release_stale_supervisors(&self, force: bool) -> DistributorResult<()> {
        let mut force = force;
        match self.broker.get(PROCESS_STALED_KEY).await {
            Ok(Some(_)) => {
                force = true;
                if let Err(error) = self.broker.del(PROCESS_STALED_KEY).await {
                    warn!(%error, "failed to clear staled flag");
                }
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "failed to read staled flag"),
        }

        if !force
            && !self
                .lock
                .lock(RELEASE_SUPERVISORS_LOCK, RELEASE_LEASE_MS)
                .await?
        {
            return Ok(());
        }
        self.flush_stale().await
    }

    async fn flush_stale(&self) -> DistributorResult<()> {
        let now = epoch_ms();
        let supervisor_cutoff = now.saturating_sub(self.config.supervisor.stale_secs * 1_000);
        let worker_cutoff = now.saturating_sub(self.config.process.stale_secs * 1_000);

        let stale_supervisors: Vec<String> = self
            .store
            .list_supervisors()?
            .into_iter()
            .filter(|s| s.last_ping_at <= supervisor_cutoff)
            .map(|s| s.id)
            .collect();

        let mut lost_channels: Vec<String> = Vec::new();
        let mut swept_workers = 0u32;
        for worker in self.store.list_workers()? {
            let stale = worker.state == chatgrid_state::WorkerState::Terminated
                || worker.last_ping_at < worker_cutoff
                || stale_supervisors.iter().any(|s| s == &worker.supervisor_id);
            if !stale {
                continue;
            }

            lost_channels.extend(worker.channels.iter().cloned());

            // Whatever was still addressed to the dead worker: joins
            // collapse into the lost-channel set, anything else goes
            // back verbatim.
            for command in self.queue.pending(&input_queue(&worker.id)).await? {
                match command.kind {
                    CommandKind::Join => {
                        if let Some(channel) = command.options.channel {
                            lost_channels.push(channel);
                        }
                    }
                    _ => self.queue.unshift_command(SHARE_QUEUE, &command).await?,
                }
            }

            self.store.delete_worker(&worker.id)?;
            swept_workers += 1;
        }

        for id in &stale_supervisors {
            self.store.delete_supervisor(id)?;
        }

        let channels = sanitize_all(lost_channels);
        for channel in channels.iter().rev() {
            self.queue
                .unshift(SHARE_QUEUE, CommandKind::Join, CommandOptions::channel(channel))
                .await?;
        }

        if swept_workers > 0 || !stale_supervisors.is_empty() {
            info!(
                workers = swept_workers,
                supervisors = stale_supervisors.len(),
                requeued_channels = channels.len(),
                "swept stale rows"
            );
        }
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Stop accepting work and wait for an in-flight drain to finish
    /// (it re-queues its remainder once it notices the flag).
    pub async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        while self.executing.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(TERMINATE_POLL_MS)).await;
        }
    }
}
