//! The worker-side runner.
//!
//! Each worker task drives one [`ChatClient`]. On every periodic tick it
//! counts client traffic, drains its private command queue plus the
//! wildcard queue, applies joins and parts, and heartbeats its row in
//! the cluster store. Termination (requested or self-decided) re-queues
//! the worker's channels at the front of the shared queue so another
//! worker picks them up with priority.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use chatgrid_broker::{
    CommandQueue, PROCESS_STALED_KEY, SHARE_QUEUE, SetOptions, SharedStore, WILDCARD_QUEUE,
    input_queue,
};
use chatgrid_core::channel::sanitize_all;
use chatgrid_core::config::DistributionMode;
use chatgrid_core::{
    ChatClient, ClientEvent, ClusterConfig, ClusterEvent, Command, CommandKind, CommandOptions,
    ReadyState, epoch_ms, sanitize,
};
use chatgrid_state::{ClusterStore, WorkerId, WorkerMetrics, WorkerState};

use crate::process::WorkerSignal;

/// How long the client may sit continuously closed before the worker
/// gives up and terminates itself.
const DISCONNECT_GRACE: Duration = Duration::from_secs(15);

/// Grace before a failed join is reported; the client may still get
/// there on its own (e.g. a retry inside the protocol layer).
const JOIN_REPORT_GRACE: Duration = Duration::from_secs(1);

enum Tick {
    Continue,
    Terminate,
}

pub struct WorkerRunner<C, S: SharedStore> {
    id: WorkerId,
    client: C,
    queue: CommandQueue<S>,
    broker: S,
    store: ClusterStore,
    config: Arc<ClusterConfig>,
    events: broadcast::Sender<ClusterEvent>,
    metrics: WorkerMetrics,
    /// Secondary client usernames this worker hosts.
    clients: Vec<String>,
    closed_since: Option<Instant>,
    disconnect_grace: Duration,
    /// Keeps the pub/sub funnel open even with no live subscriptions,
    /// so the delivery arm of the run loop stays pending instead of
    /// resolving `None` forever.
    delivery_keepalive: Option<mpsc::UnboundedSender<Command>>,
}

impl<C, S> WorkerRunner<C, S>
where
    C: ChatClient + Clone,
    S: SharedStore,
{
    pub fn new(
        id: WorkerId,
        client: C,
        store: ClusterStore,
        broker: S,
        config: Arc<ClusterConfig>,
        events: broadcast::Sender<ClusterEvent>,
    ) -> Self {
        Self {
            id,
            client,
            queue: CommandQueue::new(broker.clone()),
            broker,
            store,
            config,
            events,
            metrics: WorkerMetrics::default(),
            clients: Vec::new(),
            closed_since: None,
            disconnect_grace: DISCONNECT_GRACE,
            delivery_keepalive: None,
        }
    }

    #[cfg(test)]
    fn set_disconnect_grace(&mut self, grace: Duration) {
        self.disconnect_grace = grace;
    }

    /// Run until signalled. Consumes the runner; the task ends when this
    /// returns, which is what the pool observes as the worker leaving.
    pub async fn run(mut self, mut control: mpsc::UnboundedReceiver<WorkerSignal>) {
        let mut timer =
            tokio::time::interval(Duration::from_millis(self.config.process.periodic_timer_ms));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut deliveries = self.subscribe_deliveries().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if matches!(self.tick().await, Tick::Terminate) {
                        self.terminate().await;
                        return;
                    }
                }
                Some(command) = deliveries.recv() => {
                    self.metrics.queue_commands += 1;
                    self.apply(command).await;
                }
                signal = control.recv() => match signal {
                    Some(WorkerSignal::Terminate) | None => {
                        self.terminate().await;
                        return;
                    }
                    Some(WorkerSignal::Kill) => {
                        warn!(worker = %self.id, "killed without cleanup");
                        return;
                    }
                },
            }
        }
    }

    /// In pub/sub mode the distributor publishes to per-kind topics
    /// instead of the input queue; funnel all of them into one channel
    /// the run loop can select on. In queue mode the funnel stays empty.
    async fn subscribe_deliveries(&mut self) -> mpsc::UnboundedReceiver<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.config.distribution.mode == DistributionMode::PubSub {
            let kinds = [
                CommandKind::Join,
                CommandKind::Part,
                CommandKind::CreateClient,
                CommandKind::DeleteClient,
            ];
            for kind in kinds {
                let topic = format!("{}:{}", self.id, kind.as_str());
                let mut subscription = match self.broker.subscribe(&topic).await {
                    Ok(subscription) => subscription,
                    Err(error) => {
                        warn!(worker = %self.id, %topic, %error, "failed to subscribe");
                        continue;
                    }
                };
                let tx = tx.clone();
                let worker = self.id.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            // The runner dropped its receiver; stop.
                            _ = tx.closed() => return,
                            payload = subscription.recv() => {
                                let Some(payload) = payload else { return };
                                match serde_json::from_str::<Command>(&payload) {
                                    Ok(command) => {
                                        if tx.send(command).is_err() {
                                            return;
                                        }
                                    }
                                    Err(error) => {
                                        warn!(%worker, %error, "dropping malformed published command");
                                    }
                                }
                            }
                        }
                    }
                });
            }
        }
        self.delivery_keepalive = Some(tx);
        rx
    }

    async fn tick(&mut self) -> Tick {
        self.count_traffic();

        match self.client.ready_state() {
            ReadyState::Closed => {
                let since = *self.closed_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.disconnect_grace {
                    info!(worker = %self.id, "client closed too long, terminating");
                    return Tick::Terminate;
                }
                return Tick::Continue;
            }
            ReadyState::Connecting => return Tick::Continue,
            ReadyState::Open => self.closed_since = None,
        }

        self.process_pending().await;

        let ok = self.heartbeat(WorkerState::Open);
        if !ok {
            // Our row was swept as stale; the cluster has already
            // redistributed our channels, so keeping going would double
            // them up.
            warn!(worker = %self.id, "row gone from store, terminating");
            return Tick::Terminate;
        }
        Tick::Continue
    }

    fn count_traffic(&mut self) {
        for event in self.client.drain_events() {
            match event {
                ClientEvent::Message => self.metrics.messages += 1,
                ClientEvent::RawMessage => self.metrics.raw_messages += 1,
                ClientEvent::Connected | ClientEvent::Disconnected => {}
            }
        }
    }

    async fn process_pending(&mut self) {
        let mut commands = match self.queue.pending(&input_queue(&self.id)).await {
            Ok(commands) => commands,
            Err(error) => {
                warn!(worker = %self.id, %error, "failed to drain input queue");
                return;
            }
        };
        match self.queue.pending(WILDCARD_QUEUE).await {
            Ok(wildcard) => commands.extend(wildcard),
            Err(error) => warn!(worker = %self.id, %error, "failed to drain wildcard queue"),
        }

        for command in commands {
            self.metrics.queue_commands += 1;
            self.apply(command).await;
        }
    }

    async fn apply(&mut self, command: Command) {
        match command.kind {
            CommandKind::Join => {
                let Some(channel) = command.options.channel.as_deref().map(sanitize) else {
                    return;
                };
                if let Err(error) = self.client.join(&channel).await {
                    self.report_join_failure(channel, error.to_string());
                }
            }
            CommandKind::Part => {
                let Some(channel) = command.options.channel.as_deref().map(sanitize) else {
                    return;
                };
                if let Err(error) = self.client.part(&channel).await {
                    warn!(worker = %self.id, %channel, %error, "part failed");
                    let _ = self.events.send(ClusterEvent::PartError {
                        channel,
                        error: error.to_string(),
                    });
                }
            }
            CommandKind::CreateClient => {
                // Connection management for the secondary identity lives
                // behind the ChatClient boundary; the runner tracks the
                // hosted username and joins the client's channels so the
                // heartbeat reports them like any other assignment.
                if let Some(username) = command.options.username {
                    if !self.clients.contains(&username) {
                        debug!(worker = %self.id, %username, "hosting dedicated client");
                        self.clients.push(username);
                    }
                }
                for channel in sanitize_all(command.options.channels) {
                    if let Err(error) = self.client.join(&channel).await {
                        self.report_join_failure(channel, error.to_string());
                    }
                }
            }
            CommandKind::DeleteClient => {
                if let Some(username) = command.options.username {
                    self.clients.retain(|u| u != &username);
                }
            }
        }
    }

    /// A failed join is only an error if the channel still isn't joined
    /// after a short grace; reported off-task so the tick isn't blocked.
    fn report_join_failure(&self, channel: String, error: String) {
        let client = self.client.clone();
        let events = self.events.clone();
        let worker = self.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(JOIN_REPORT_GRACE).await;
            if !client.channels().contains(&channel) {
                warn!(%worker, %channel, %error, "join failed");
                let _ = events.send(ClusterEvent::JoinError { channel, error });
            }
        });
    }

    fn heartbeat(&self, state: WorkerState) -> bool {
        let channels = sanitize_all(self.client.channels());
        let memory_bytes = if self.config.metrics.memory {
            current_memory_bytes()
        } else {
            0
        };
        let metrics = WorkerMetrics {
            memory_bytes,
            ..self.metrics.clone()
        };
        match self.store.heartbeat_worker(
            &self.id,
            state,
            channels,
            self.clients.clone(),
            &metrics,
            epoch_ms(),
        ) {
            Ok(found) => found,
            Err(error) => {
                warn!(worker = %self.id, %error, "heartbeat failed");
                // A transient store error is not evidence the row is gone.
                true
            }
        }
    }

    async fn terminate(mut self) {
        info!(worker = %self.id, "terminating");

        // Let the next stale sweep redistribute immediately instead of
        // waiting out the stale window.
        if let Err(error) = self
            .broker
            .set(PROCESS_STALED_KEY, "1", SetOptions::default())
            .await
        {
            warn!(worker = %self.id, %error, "failed to set staled flag");
        }

        // Our channels go back to the front of the shared queue so they
        // are re-placed before anything newly requested.
        let channels = sanitize_all(self.client.channels());
        for channel in channels.iter().rev() {
            if let Err(error) = self
                .queue
                .unshift(SHARE_QUEUE, CommandKind::Join, CommandOptions::channel(channel))
                .await
            {
                warn!(worker = %self.id, %channel, %error, "failed to re-queue channel");
            }
        }

        self.count_traffic();
        self.heartbeat(WorkerState::Terminated);
    }
}

/// Resident memory of this process, via procfs; zero where unavailable.
pub fn current_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| {
            statm
                .split_whitespace()
                .nth(1)
                .and_then(|pages| pages.parse::<u64>().ok())
        })
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use chatgrid_broker::MemoryBroker;
    use chatgrid_state::WorkerRecord;

    #[derive(Default)]
    struct FakeState {
        channels: Vec<String>,
        ready: Option<ReadyState>,
        events: Vec<ClientEvent>,
        failing: HashSet<String>,
    }

    #[derive(Clone, Default)]
    struct FakeClient {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeClient {
        fn open() -> Self {
            let client = Self::default();
            client.state.lock().unwrap().ready = Some(ReadyState::Open);
            client
        }

        fn set_ready(&self, ready: ReadyState) {
            self.state.lock().unwrap().ready = Some(ready);
        }

        fn fail_join(&self, channel: &str) {
            self.state.lock().unwrap().failing.insert(channel.into());
        }

        fn push_event(&self, event: ClientEvent) {
            self.state.lock().unwrap().events.push(event);
        }
    }

    impl ChatClient for FakeClient {
        async fn join(&self, channel: &str) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.failing.contains(channel) {
                anyhow::bail!("msg_channel_suspended");
            }
            if !state.channels.iter().any(|c| c == channel) {
                state.channels.push(channel.to_string());
            }
            Ok(())
        }

        async fn part(&self, channel: &str) -> anyhow::Result<()> {
            self.state.lock().unwrap().channels.retain(|c| c != channel);
            Ok(())
        }

        fn channels(&self) -> Vec<String> {
            self.state.lock().unwrap().channels.clone()
        }

        fn ready_state(&self) -> ReadyState {
            self.state.lock().unwrap().ready.unwrap_or(ReadyState::Open)
        }

        fn drain_events(&self) -> Vec<ClientEvent> {
            std::mem::take(&mut self.state.lock().unwrap().events)
        }
    }

    struct Fixture {
        client: FakeClient,
        store: ClusterStore,
        broker: MemoryBroker,
        queue: CommandQueue<MemoryBroker>,
        events: broadcast::Sender<ClusterEvent>,
        runner: WorkerRunner<FakeClient, MemoryBroker>,
    }

    fn fixture() -> Fixture {
        let client = FakeClient::open();
        let store = ClusterStore::open_in_memory().unwrap();
        let broker = MemoryBroker::new();
        let queue = CommandQueue::new(broker.clone());
        let (events, _) = broadcast::channel(64);

        let mut config = ClusterConfig::default();
        config.process.periodic_timer_ms = 20;
        config.metrics.memory = false;

        store
            .put_worker(&WorkerRecord::starting("w1".into(), "sup-a".into(), 1000))
            .unwrap();

        let runner = WorkerRunner::new(
            "w1".into(),
            client.clone(),
            store.clone(),
            broker.clone(),
            Arc::new(config),
            events.clone(),
        );
        Fixture {
            client,
            store,
            broker,
            queue,
            events,
            runner,
        }
    }

    #[tokio::test]
    async fn drains_private_and_wildcard_queues() {
        let f = fixture();
        f.queue
            .push(&input_queue("w1"), CommandKind::Join, CommandOptions::channel("#private"))
            .await
            .unwrap();
        f.queue
            .push(WILDCARD_QUEUE, CommandKind::Join, CommandOptions::channel("Wild"))
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(f.runner.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let channels = f.client.channels();
        assert!(channels.contains(&"#private".to_string()));
        assert!(channels.contains(&"#wild".to_string()));

        let record = f.store.get_worker("w1").unwrap().unwrap();
        assert_eq!(record.state, WorkerState::Open);
        assert!(record.channels.contains(&"#private".to_string()));

        tx.send(WorkerSignal::Terminate).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn terminate_requeues_channels_with_priority() {
        let f = fixture();
        f.client.join("#a").await.unwrap();
        f.client.join("#b").await.unwrap();
        // Something already waiting in the shared queue.
        f.queue
            .push(SHARE_QUEUE, CommandKind::Join, CommandOptions::channel("#old"))
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(f.runner.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(WorkerSignal::Terminate).unwrap();
        task.await.unwrap();

        // Re-queued channels land in front of the pre-existing command,
        // in their original order.
        let pending = f.queue.pending(SHARE_QUEUE).await.unwrap();
        let channels: Vec<_> = pending
            .iter()
            .filter_map(|c| c.options.channel.clone())
            .collect();
        assert_eq!(channels, vec!["#a", "#b", "#old"]);

        // Final heartbeat marks the row terminated.
        let record = f.store.get_worker("w1").unwrap().unwrap();
        assert_eq!(record.state, WorkerState::Terminated);

        // And the staled flag prompts an immediate sweep.
        assert!(f.broker.get(PROCESS_STALED_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn join_failure_emits_event_after_grace() {
        let f = fixture();
        f.client.fail_join("#banned");
        let mut events = f.events.subscribe();
        f.queue
            .push(&input_queue("w1"), CommandKind::Join, CommandOptions::channel("#banned"))
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(f.runner.run(rx));

        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("join error should be reported")
            .unwrap();
        assert!(matches!(
            event,
            ClusterEvent::JoinError { ref channel, .. } if channel == "#banned"
        ));

        tx.send(WorkerSignal::Kill).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn closed_client_terminates_after_grace() {
        let mut f = fixture();
        f.client.join("#survivor").await.unwrap();
        f.client.set_ready(ReadyState::Closed);
        f.runner.set_disconnect_grace(Duration::from_millis(50));

        let (_tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(f.runner.run(rx));

        // Exits on its own, without any signal.
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("runner should self-terminate")
            .unwrap();

        // Channels were still handed back for redistribution.
        let pending = f.queue.pending(SHARE_QUEUE).await.unwrap();
        assert_eq!(pending[0].options.channel.as_deref(), Some("#survivor"));
    }

    #[tokio::test]
    async fn swept_row_stops_the_worker() {
        let f = fixture();
        f.store.delete_worker("w1").unwrap();

        let (_tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(f.runner.run(rx));
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("runner should stop once its row is gone")
            .unwrap();
    }

    #[tokio::test]
    async fn traffic_counters_reach_the_store() {
        let f = fixture();
        f.client.push_event(ClientEvent::Message);
        f.client.push_event(ClientEvent::Message);
        f.client.push_event(ClientEvent::RawMessage);

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(f.runner.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(WorkerSignal::Terminate).unwrap();
        task.await.unwrap();

        let record = f.store.get_worker("w1").unwrap().unwrap();
        assert_eq!(record.metrics.messages, 2);
        assert_eq!(record.metrics.raw_messages, 1);
    }

    #[tokio::test]
    async fn published_commands_are_applied_in_pubsub_mode() {
        let client = FakeClient::open();
        let store = ClusterStore::open_in_memory().unwrap();
        let broker = MemoryBroker::new();
        let (events, _) = broadcast::channel(16);

        let mut config = ClusterConfig::default();
        config.process.periodic_timer_ms = 20;
        config.metrics.memory = false;
        config.distribution.mode = DistributionMode::PubSub;

        store
            .put_worker(&WorkerRecord::starting("w1".into(), "sup-a".into(), 1000))
            .unwrap();
        let runner = WorkerRunner::new(
            "w1".into(),
            client.clone(),
            store,
            broker.clone(),
            Arc::new(config),
            events,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(runner.run(rx));
        // Give the runner a moment to register its subscriptions.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let command = Command::new(CommandKind::Join, CommandOptions::channel("#pushed"));
        let delivered = broker
            .publish("w1:join", serde_json::to_string(&command).unwrap())
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.channels().contains(&"#pushed".to_string()));

        tx.send(WorkerSignal::Terminate).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn hosts_and_releases_dedicated_clients() {
        let f = fixture();
        f.queue
            .push(&input_queue("w1"), CommandKind::CreateClient, CommandOptions::client("secondbot"))
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(f.runner.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let record = f.store.get_worker("w1").unwrap().unwrap();
        assert_eq!(record.clients, vec!["secondbot"]);

        f.queue
            .push(&input_queue("w1"), CommandKind::DeleteClient, CommandOptions::client("secondbot"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let record = f.store.get_worker("w1").unwrap().unwrap();
        assert!(record.clients.is_empty());

        tx.send(WorkerSignal::Terminate).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn dedicated_client_channels_are_joined_and_reported() {
        let f = fixture();
        f.queue
            .push(
                &input_queue("w1"),
                CommandKind::CreateClient,
                CommandOptions {
                    channel: None,
                    channels: vec!["#Forsen".into()],
                    username: Some("secondbot".into()),
                    password: Some("oauth:xyz".into()),
                },
            )
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(f.runner.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The channel is actually joined, not just recorded against the
        // username, and the heartbeat carries it so placement never
        // assigns it a second time.
        assert!(f.client.channels().contains(&"#forsen".to_string()));
        let record = f.store.get_worker("w1").unwrap().unwrap();
        assert_eq!(record.clients, vec!["secondbot"]);
        assert!(record.channels.contains(&"#forsen".to_string()));

        tx.send(WorkerSignal::Terminate).unwrap();
        task.await.unwrap();
    }
}
