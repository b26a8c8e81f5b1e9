//! Client event loop: wires push channel → state store → widget scheduler →
//! command executor.
//!
//! Everything that mutates client state happens on this one loop, driven by
//! four sources: the fixed-rate tick, push-channel session events, finished
//! command runs and user commands. Command runs themselves stream in their own
//! tasks and report back through the completion channel.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use vmon_core::scheduler::DEFAULT_WATCH_CADENCE_SECS;
use vmon_core::{
    BufferRegion, ClientEvent, Event, MetricDelta, OutputMode, RefreshRequest, RegionId,
    ReloadRequired, StateStore, WidgetId, WidgetScheduler,
};
use vmon_transport::{
    CommandError, CommandRunner, CommandStreamExecutor, PushConnector, RunOptions, RunOutcome,
    SharedRegion, TransportManager, TransportEvent, shared_region,
};

use crate::config::Settings;

const OBSERVER_CAPACITY: usize = 256;

/// Why [`ClientLoop::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    /// Device restarted. All client state is stale and must be rebuilt.
    Reload(ReloadRequired),
}

/// What passive observers see.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Metrics(MetricDelta),
    Event(Event),
    ConnectionClosed,
}

pub type Observers = broadcast::Sender<Observation>;

pub fn observers() -> Observers {
    broadcast::channel(OBSERVER_CAPACITY).0
}

/// Keep a region's widgets refreshing after a user command succeeds there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watch {
    pub count: u32,
    pub cadence_secs: u64,
}

impl Watch {
    pub fn new(count: u32) -> Self {
        Self {
            count,
            cadence_secs: DEFAULT_WATCH_CADENCE_SECS,
        }
    }
}

/// Operator-initiated command, answered on `done`.
#[derive(Debug)]
pub struct UserCommand {
    pub command: String,
    pub region: RegionId,
    pub mode: OutputMode,
    pub watch: Option<Watch>,
    /// Cancelled by the requester to abort the run.
    pub cancel: CancellationToken,
    pub done: oneshot::Sender<Result<RunOutcome, CommandError>>,
}

impl UserCommand {
    pub fn new(
        command: impl Into<String>,
        region: RegionId,
        mode: OutputMode,
    ) -> (Self, oneshot::Receiver<Result<RunOutcome, CommandError>>) {
        let (done, rx) = oneshot::channel();
        let cmd = Self {
            command: command.into(),
            region,
            mode,
            watch: None,
            cancel: CancellationToken::new(),
            done,
        };
        (cmd, rx)
    }

    pub fn with_watch(mut self, watch: Watch) -> Self {
        self.watch = Some(watch);
        self
    }
}

enum Completion {
    Widget {
        id: WidgetId,
        result: Result<RunOutcome, CommandError>,
    },
    User {
        region: RegionId,
        watch: Option<Watch>,
        result: Result<RunOutcome, CommandError>,
        done: oneshot::Sender<Result<RunOutcome, CommandError>>,
    },
}

pub struct ClientLoop<C, R> {
    transport: TransportManager<C>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    scheduler: WidgetScheduler,
    store: StateStore,
    executor: CommandStreamExecutor<R>,
    regions: HashMap<RegionId, SharedRegion>,
    observers: Observers,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    /// Parent of every widget run's token.
    widget_runs: CancellationToken,
    /// Every spawned run, widget or user. Drained before `run` returns so no
    /// run outlives the client that started it.
    runs: JoinSet<()>,
    user_runs: HashMap<RegionId, CancellationToken>,
    /// User commands waiting for their region to go idle.
    pending: VecDeque<UserCommand>,
    tick_interval: Duration,
    force_prime: bool,
    /// Wall clock at start, advanced by the runtime clock.
    clock: (DateTime<Utc>, Instant),
}

impl<C: PushConnector, R: CommandRunner> ClientLoop<C, R> {
    /// Fresh client state from `settings`. Widgets whose region is not in
    /// `regions` write to a detached buffer.
    pub fn new(
        settings: &Settings,
        connector: C,
        runner: R,
        regions: impl IntoIterator<Item = (RegionId, SharedRegion)>,
        observers: Observers,
    ) -> anyhow::Result<Self> {
        let scheduler = settings.scheduler()?;
        let executor = CommandStreamExecutor::new(runner, settings.timeout_policy()?);
        let (transport, transport_rx) = TransportManager::new(connector, settings.inhibit_cycles);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let mut regions: HashMap<RegionId, SharedRegion> = regions.into_iter().collect();
        for w in scheduler.widgets() {
            regions
                .entry(w.region.clone())
                .or_insert_with(|| shared_region(BufferRegion::new()));
        }

        Ok(Self {
            transport,
            transport_rx,
            scheduler,
            store: StateStore::new(settings.monotonic_key.clone()),
            executor,
            regions,
            observers,
            completions_tx,
            completions_rx,
            widget_runs: CancellationToken::new(),
            runs: JoinSet::new(),
            user_runs: HashMap::new(),
            pending: VecDeque::new(),
            tick_interval: settings.tick_interval(),
            force_prime: false,
            clock: (Utc::now(), Instant::now()),
        })
    }

    /// Refresh every widget at startup instead of only those with empty regions.
    pub fn force_prime(mut self, force: bool) -> Self {
        self.force_prime = force;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn scheduler(&self) -> &WidgetScheduler {
        &self.scheduler
    }

    #[cfg(test)]
    fn region(&self, id: &RegionId) -> Option<&SharedRegion> {
        self.regions.get(id)
    }

    /// Run until `shutdown` fires, the command channel closes, or the device
    /// restarts.
    pub async fn run(
        &mut self,
        commands: &mut mpsc::Receiver<UserCommand>,
        shutdown: CancellationToken,
    ) -> LoopExit {
        self.clock = (Utc::now(), Instant::now());
        self.prime(self.now());

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break LoopExit::Shutdown,
                Some(event) = self.transport_rx.recv() => {
                    if let Some(event) = self.transport.handle(event)
                        && let Err(reload) = self.dispatch(event, self.now())
                    {
                        break LoopExit::Reload(reload);
                    }
                }
                Some(done) = self.completions_rx.recv() => self.on_completion(done, self.now()),
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_user_command(cmd),
                    None => break LoopExit::Shutdown,
                },
                Some(joined) = self.runs.join_next(), if !self.runs.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!("command run task failed: {e}");
                    }
                }
                _ = ticker.tick() => self.on_tick(self.now()),
            }
        };

        match &exit {
            LoopExit::Shutdown => tracing::info!("client loop stopped"),
            LoopExit::Reload(reload) => tracing::warn!("{reload}, rebuilding client state"),
        }
        self.stop().await;
        exit
    }

    fn now(&self) -> DateTime<Utc> {
        let (wall, start) = self.clock;
        wall + TimeDelta::from_std(start.elapsed()).unwrap_or(TimeDelta::zero())
    }

    fn prime(&mut self, now: DateTime<Utc>) {
        let regions = &self.regions;
        let requests = self.scheduler.prime(now, self.force_prime, |id| {
            regions
                .get(id)
                .and_then(|r| r.try_lock().ok().map(|r| r.text().is_empty()))
                .unwrap_or(false)
        });
        tracing::debug!(widgets = requests.len(), "initial widget population");
        for req in requests {
            self.spawn_refresh(req);
        }
    }

    fn on_tick(&mut self, now: DateTime<Utc>) {
        self.transport.ensure_connected();
        for req in self.scheduler.tick(now) {
            self.spawn_refresh(req);
        }
    }

    /// Apply one normalized push message. The store is updated before any
    /// observer or widget sees the delta.
    fn dispatch(&mut self, event: ClientEvent, now: DateTime<Utc>) -> Result<(), ReloadRequired> {
        match event {
            ClientEvent::MetricDelta(delta) => {
                self.store.apply_delta(&delta)?;
                tracing::debug!(keys = delta.len(), "metrics merged");
                let _ = self.observers.send(Observation::Metrics(delta));
            }
            ClientEvent::NamedEvent(event) => {
                tracing::debug!(event = %event.name, "event received");
                let requests = self.scheduler.on_event(&event.name, now);
                let _ = self.observers.send(Observation::Event(event));
                for req in requests {
                    self.spawn_refresh(req);
                }
            }
            ClientEvent::ConnectionClosed => {
                let _ = self.observers.send(Observation::ConnectionClosed);
            }
        }
        Ok(())
    }

    fn spawn_refresh(&mut self, req: RefreshRequest) {
        if self.user_runs.contains_key(&req.region) {
            // the user's command owns the region; coalesce
            self.scheduler.complete(req.widget);
            return;
        }
        let region = self.region_or_detached(&req.region);
        let executor = self.executor.clone();
        let cancel = self.widget_runs.child_token();
        let tx = self.completions_tx.clone();
        tracing::debug!(widget = %req.widget, trigger = ?req.trigger, command = %req.command, "widget refresh");

        self.runs.spawn(async move {
            let options = RunOptions {
                mode: req.mode,
                idle_timeout: None,
            };
            let result = executor
                .run(&req.command, &req.region, &region, options, cancel)
                .await;
            let _ = tx.send(Completion::Widget {
                id: req.widget,
                result,
            });
        });
    }

    fn on_user_command(&mut self, cmd: UserCommand) {
        let disarmed = self.scheduler.disarm(&cmd.region);
        if disarmed > 0 {
            tracing::debug!(region = %cmd.region, disarmed, "widget refresh paused for user command");
        }
        if self.region_busy(&cmd.region) {
            tracing::debug!(region = %cmd.region, command = %cmd.command, "user command queued");
            self.pending.push_back(cmd);
            return;
        }
        self.start_user_command(cmd);
    }

    fn region_busy(&self, region: &RegionId) -> bool {
        self.scheduler.is_region_in_flight(region) || self.user_runs.contains_key(region)
    }

    /// Start the oldest queued user command for `region`, once it is idle.
    fn start_pending(&mut self, region: &RegionId) {
        if self.region_busy(region) {
            return;
        }
        if let Some(pos) = self.pending.iter().position(|c| &c.region == region)
            && let Some(cmd) = self.pending.remove(pos)
        {
            self.start_user_command(cmd);
        }
    }

    fn start_user_command(&mut self, cmd: UserCommand) {
        if cmd.cancel.is_cancelled() {
            let _ = cmd.done.send(Err(CommandError::Cancelled));
            self.start_pending(&cmd.region);
            return;
        }
        let UserCommand {
            command,
            region: region_id,
            mode,
            watch,
            cancel,
            done,
        } = cmd;

        let region = self.region_or_detached(&region_id);
        self.user_runs.insert(region_id.clone(), cancel.clone());
        let executor = self.executor.clone();
        let tx = self.completions_tx.clone();

        self.runs.spawn(async move {
            let options = RunOptions {
                mode,
                idle_timeout: None,
            };
            let result = executor
                .run(&command, &region_id, &region, options, cancel)
                .await;
            let _ = tx.send(Completion::User {
                region: region_id,
                watch,
                result,
                done,
            });
        });
    }

    fn on_completion(&mut self, completion: Completion, now: DateTime<Utc>) {
        match completion {
            Completion::Widget { id, result } => {
                self.scheduler.complete(id);
                if let Err(e) = result {
                    tracing::debug!(widget = %id, "widget refresh failed: {e}");
                }
                if let Some(region) = self.scheduler.widget(id).map(|w| w.region.clone()) {
                    self.start_pending(&region);
                }
            }
            Completion::User {
                region,
                watch,
                result,
                done,
            } => {
                self.user_runs.remove(&region);
                if let (Ok(_), Some(watch)) = (&result, watch) {
                    self.scheduler
                        .arm(&region, watch.count, watch.cadence_secs, now);
                }
                let _ = done.send(result);
                self.start_pending(&region);
            }
        }
    }

    fn region_or_detached(&mut self, id: &RegionId) -> SharedRegion {
        self.regions
            .entry(id.clone())
            .or_insert_with(|| shared_region(BufferRegion::new()))
            .clone()
    }

    /// Cancel every run and wait until each has let go of its region.
    async fn stop(&mut self) {
        self.widget_runs.cancel();
        for (_, token) in self.user_runs.drain() {
            token.cancel();
        }
        // dropping a queued command answers its requester with a closed channel
        self.pending.clear();
        self.transport.shutdown();

        while let Some(joined) = self.runs.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("command run task failed: {e}");
            }
        }
        // answer user commands that finished while stopping
        while let Ok(completion) = self.completions_rx.try_recv() {
            if let Completion::User { done, result, .. } = completion {
                let _ = done.send(result);
            }
        }
    }
}

impl<C, R> Drop for ClientLoop<C, R> {
    // `runs` aborts whatever is left when dropped
    fn drop(&mut self) {
        self.widget_runs.cancel();
        for token in self.user_runs.values() {
            token.cancel();
        }
    }
}

/// Shared inputs for every client rebuilt by [`drive`].
pub struct ClientParts<'a, C, R> {
    pub settings: &'a Settings,
    pub connector: C,
    pub runner: R,
    pub regions: &'a [(RegionId, SharedRegion)],
    pub observers: Observers,
    pub force_prime: bool,
}

/// Run clients until shutdown. A device restart throws the whole client
/// away: regions are cleared and a fresh loop starts from the settings.
pub async fn drive<C, R>(
    parts: ClientParts<'_, C, R>,
    commands: &mut mpsc::Receiver<UserCommand>,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    C: PushConnector + Clone,
    R: CommandRunner + Clone,
{
    loop {
        let mut client = ClientLoop::new(
            parts.settings,
            parts.connector.clone(),
            parts.runner.clone(),
            parts.regions.iter().cloned(),
            parts.observers.clone(),
        )?
        .force_prime(parts.force_prime);
        tracing::debug!(widgets = client.scheduler().len(), "client starting");

        match client.run(commands, shutdown.clone()).await {
            LoopExit::Shutdown => return Ok(()),
            LoopExit::Reload(_) => {
                tracing::debug!(
                    metrics = client.store().snapshot().len(),
                    "discarding client state"
                );
                drop(client);
                for (_, region) in parts.regions {
                    let mut region = region.lock().await;
                    region.replace_text("");
                    region.set_loading(false);
                }
                tracing::info!("client state rebuilt after device restart");
            }
        }
    }
}
