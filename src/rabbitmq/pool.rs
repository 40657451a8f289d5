// src/rabbitmq/pool.rs
// Consumer pool controller: keeps between min and max consumers alive on
// one queue, restarts failed ones, scales on backlog and shuts down cleanly.

use super::channel_manager::ChannelPool;
use super::connection::ConnectionManager;
use super::consumer::{
    run_consumer, ConsumerContext, ConsumerExit, ConsumerShared, ConsumerSnapshot, ConsumerState,
};
use super::dispatcher::DispatchRouter;
use super::errors::{RabbitMQError, Result};
use super::scaling::{Autoscaler, BacklogProbe, BacklogSample, QueueDepthProbe, ScalingAction};
use super::tag::{ConsumerTagStrategy, IncrementingTagStrategy, TagRegistry};
use super::tracker::AckTracker;
use crate::config::{RuntimeConfig, ScalingConfig};
use crate::message::Disposition;
use futures::FutureExt;
use serde::Serialize;
use std::cmp::Reverse;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Outcome counters of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub dead_lettered: u64,
    pub unroutable: u64,
    pub handler_failures: u64,
    /// Deliveries requeued because they were still in flight at shutdown.
    pub forced_requeues: u64,
    pub consumer_restarts: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    acked: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
    dead_lettered: AtomicU64,
    unroutable: AtomicU64,
    handler_failures: AtomicU64,
    pub(crate) forced_requeues: AtomicU64,
    restarts: AtomicU64,
}

impl Counters {
    pub(crate) fn record(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Acked => &self.acked,
            Disposition::Requeued => &self.requeued,
            Disposition::Discarded => &self.discarded,
            Disposition::DeadLettered => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_handler_failures(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            forced_requeues: self.forced_requeues.load(Ordering::Relaxed),
            consumer_restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// Result of [`PoolHandle::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub consumers_stopped: usize,
    /// In-flight deliveries nacked with requeue at the shutdown timeout.
    pub forced_requeues: usize,
}

enum Command {
    Scale {
        target: usize,
        reply: oneshot::Sender<usize>,
    },
    Stop {
        reply: oneshot::Sender<ShutdownReport>,
    },
}

type Roster = Arc<Mutex<Vec<Arc<ConsumerShared>>>>;

fn lock_roster(roster: &Roster) -> MutexGuard<'_, Vec<Arc<ConsumerShared>>> {
    roster.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Configured but not yet running consumer pool.
pub struct ConsumerPool {
    connection: Arc<ConnectionManager>,
    channels: ChannelPool,
    router: DispatchRouter,
    config: RuntimeConfig,
    tags: Arc<dyn ConsumerTagStrategy>,
    probe: Option<Arc<dyn BacklogProbe>>,
}

impl ConsumerPool {
    pub fn new(
        connection: Arc<ConnectionManager>,
        channels: ChannelPool,
        router: DispatchRouter,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            connection,
            channels,
            router,
            config: config.clone(),
            tags: Arc::new(IncrementingTagStrategy::new(&config.consumer.tag_prefix)),
            probe: None,
        }
    }

    pub fn with_tag_strategy<S: ConsumerTagStrategy>(mut self, strategy: S) -> Self {
        self.tags = Arc::new(strategy);
        self
    }

    pub fn with_backlog_probe<P: BacklogProbe>(mut self, probe: P) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    /// Start `min_concurrency` consumers and the supervisor.
    ///
    /// Returns once every initial consumer is subscribed. Fails with
    /// `ConfigError` before touching the broker when the configuration or
    /// the routes do not hold up.
    pub async fn start(self) -> Result<PoolHandle> {
        self.config.validate()?;
        let RuntimeConfig {
            consumer,
            dispatch,
            scaling,
            recovery,
            ..
        } = self.config;
        let (min, max) = (consumer.min_concurrency, consumer.max_concurrency);
        let queue = consumer.queue.clone();
        self.router.validate(&[queue.as_str()])?;
        if self.connection.generation() == 0 {
            self.connection.connect().await?;
        }

        let counters = Arc::new(Counters::default());
        let ctx = Arc::new(ConsumerContext {
            connection: Arc::clone(&self.connection),
            channels: self.channels.clone(),
            router: Arc::new(self.router),
            tracker: Arc::new(AckTracker::new(
                usize::from(consumer.max_in_flight),
                dispatch.redelivery_limit,
                dispatch.redelivery_ledger_capacity,
            )),
            workers: Arc::new(Semaphore::new(dispatch.dispatch_workers)),
            dead_letter: dispatch.dead_letter.clone(),
            counters: Arc::clone(&counters),
            queue: queue.clone(),
            prefetch: consumer.max_in_flight,
            shutdown_timeout: consumer.shutdown_timeout(),
            retry_delay: recovery.interval(),
        });
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(QueueDepthProbe::new(self.channels.clone(), &queue)));
        let roster: Roster = Arc::new(Mutex::new(Vec::new()));

        let mut supervisor = Supervisor {
            ctx,
            tags: self.tags,
            registry: TagRegistry::default(),
            slots: Vec::new(),
            tasks: JoinSet::new(),
            roster: Arc::clone(&roster),
            autoscaler: Autoscaler::new(&scaling, min, max),
            scaling,
            probe,
            min,
            max,
        };

        info!(queue = %queue, min, max, "Starting consumer pool");
        if let Err(e) = supervisor.start_initial().await {
            supervisor.shutdown().await;
            return Err(e);
        }

        let (commands, receiver) = mpsc::channel(16);
        let task = tokio::spawn(supervisor.run(receiver));

        Ok(PoolHandle {
            commands,
            roster,
            counters,
            connection: self.connection,
            queue,
            min,
            max,
            shutdown_timeout: consumer.shutdown_timeout(),
            supervisor: Some(task),
        })
    }
}

struct Slot {
    shared: Arc<ConsumerShared>,
    stop: watch::Sender<bool>,
    stopping: bool,
}

struct Supervisor {
    ctx: Arc<ConsumerContext>,
    tags: Arc<dyn ConsumerTagStrategy>,
    registry: TagRegistry,
    slots: Vec<Slot>,
    tasks: JoinSet<(String, ConsumerExit)>,
    roster: Roster,
    autoscaler: Autoscaler,
    scaling: ScalingConfig,
    probe: Arc<dyn BacklogProbe>,
    min: usize,
    max: usize,
}

impl Supervisor {
    async fn start_initial(&mut self) -> Result<()> {
        for _ in 0..self.min {
            self.add_consumer()?;
        }

        let watchers: Vec<(String, watch::Receiver<ConsumerState>)> = self
            .slots
            .iter()
            .map(|slot| (slot.shared.tag().to_string(), slot.shared.watch_state()))
            .collect();
        for (tag, mut state) in watchers {
            let settled = state
                .wait_for(|s| *s != ConsumerState::Starting)
                .await
                .map(|s| *s)
                .unwrap_or(ConsumerState::Failed);
            if settled != ConsumerState::Active {
                return Err(RabbitMQError::ConsumeError(format!(
                    "Consumer '{}' failed to start",
                    tag
                )));
            }
        }
        Ok(())
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = interval(self.scaling.sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Scale { target, reply }) => {
                        let count = self.scale_to(target);
                        let _ = reply.send(count);
                    }
                    Some(Command::Stop { reply }) => {
                        let report = self.shutdown().await;
                        let _ = reply.send(report);
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(joined) = self.tasks.join_next() => self.on_exit(joined),
                _ = ticker.tick(), if self.scaling.enabled => self.sample().await,
            }
        }
    }

    /// Consumers that are neither stopping nor stopped.
    fn live(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.stopping).count()
    }

    fn publish_roster(&self) {
        *lock_roster(&self.roster) = self.slots.iter().map(|slot| Arc::clone(&slot.shared)).collect();
    }

    fn add_consumer(&mut self) -> Result<()> {
        let tag = self.tags.create_consumer_tag(&self.ctx.queue);
        self.registry.claim(&tag)?;
        let shared = Arc::new(ConsumerShared::new(&tag, &self.ctx.queue));
        self.launch(shared, Duration::ZERO);
        self.publish_roster();
        debug!(consumer_tag = %tag, "Consumer added");
        Ok(())
    }

    fn launch(&mut self, shared: Arc<ConsumerShared>, delay: Duration) {
        let (stop, stop_rx) = watch::channel(false);
        let ctx = Arc::clone(&self.ctx);
        let task_shared = Arc::clone(&shared);
        let tag = shared.tag().to_string();
        self.tasks.spawn(async move {
            let exit = AssertUnwindSafe(run_consumer(ctx, task_shared, stop_rx, delay))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    ConsumerExit::Failed(RabbitMQError::ConsumeError(
                        "consumer task panicked".to_string(),
                    ))
                });
            (tag, exit)
        });

        match self.slots.iter_mut().find(|slot| slot.shared.tag() == shared.tag()) {
            Some(slot) => {
                slot.stop = stop;
                slot.stopping = false;
            }
            None => self.slots.push(Slot {
                shared,
                stop,
                stopping: false,
            }),
        }
    }

    /// Move toward `target` consumers, clamped to [min, max].
    fn scale_to(&mut self, target: usize) -> usize {
        let target = target.clamp(self.min, self.max);
        let live = self.live();

        if target > live {
            // Draining consumers still count against max until they exit.
            let room = self.max.saturating_sub(self.slots.len());
            let mut added = 0;
            for _ in 0..(target - live).min(room) {
                if let Err(e) = self.add_consumer() {
                    error!(error = %e, "Could not add consumer");
                    break;
                }
                added += 1;
            }
            if added > 0 {
                self.autoscaler.note_started(Instant::now());
            }
        } else if target < live {
            let loads: Vec<Option<usize>> = self
                .slots
                .iter()
                .map(|slot| {
                    (!slot.stopping).then(|| {
                        slot.shared
                            .channel()
                            .map_or(0, |channel| self.ctx.tracker.outstanding(channel))
                    })
                })
                .collect();
            for index in pick_retirees(&loads, live - target) {
                let slot = &mut self.slots[index];
                slot.stopping = true;
                if slot.stop.send(true).is_err() {
                    debug!(consumer_tag = %slot.shared.tag(), "Consumer already gone");
                }
                debug!(
                    consumer_tag = %slot.shared.tag(),
                    in_flight = loads[index].unwrap_or(0),
                    "Consumer retiring"
                );
            }
        }

        let live = self.live();
        info!(target, live, "Consumer pool scaled");
        live
    }

    fn on_exit(&mut self, joined: std::result::Result<(String, ConsumerExit), JoinError>) {
        let (tag, exit) = match joined {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "Consumer task could not be joined");
                return;
            }
        };
        let Some(index) = self.slots.iter().position(|slot| slot.shared.tag() == tag) else {
            return;
        };

        let restart = matches!(exit, ConsumerExit::Failed(_))
            && !self.slots[index].stopping
            && !self.ctx.connection.is_fatal();
        if restart {
            let shared = Arc::clone(&self.slots[index].shared);
            warn!(consumer_tag = %tag, "Restarting failed consumer");
            self.ctx.counters.restarts.fetch_add(1, Ordering::Relaxed);
            self.launch(shared, self.ctx.retry_delay);
            return;
        }

        self.slots.remove(index);
        self.registry.release(&tag);
        self.publish_roster();
        if let ConsumerExit::Failed(e) = exit {
            warn!(consumer_tag = %tag, error = %e, "Consumer will not be restarted");
        }
    }

    async fn sample(&mut self) {
        let backlog = match self.probe.backlog().await {
            Ok(backlog) => backlog,
            Err(e) => {
                debug!(error = %e, "Backlog probe failed, skipping sample");
                return;
            }
        };
        let sample = BacklogSample {
            backlog,
            in_flight: self.ctx.tracker.total_outstanding(),
        };
        let live = self.live();
        match self.autoscaler.observe(sample, live, Instant::now()) {
            ScalingAction::Up => {
                self.scale_to(live + 1);
            }
            ScalingAction::Down => {
                self.scale_to(live.saturating_sub(1));
            }
            ScalingAction::Hold => {}
        }
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        info!(consumers = self.slots.len(), "Stopping consumer pool");
        for slot in &mut self.slots {
            slot.stopping = true;
            if slot.stop.send(true).is_err() {
                debug!(consumer_tag = %slot.shared.tag(), "Consumer already gone");
            }
        }

        let mut report = ShutdownReport::default();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((tag, exit)) => {
                    report.consumers_stopped += 1;
                    if let ConsumerExit::Stopped { forced_requeues } = exit {
                        report.forced_requeues += forced_requeues;
                    }
                    self.registry.release(&tag);
                }
                Err(e) => error!(error = %e, "Consumer task could not be joined"),
            }
        }
        self.slots.clear();
        self.publish_roster();
        info!(
            consumers_stopped = report.consumers_stopped,
            forced_requeues = report.forced_requeues,
            "Consumer pool stopped"
        );
        report
    }
}

/// Control surface of a running pool.
pub struct PoolHandle {
    commands: mpsc::Sender<Command>,
    roster: Roster,
    counters: Arc<Counters>,
    connection: Arc<ConnectionManager>,
    queue: String,
    min: usize,
    max: usize,
    shutdown_timeout: Duration,
    supervisor: Option<JoinHandle<()>>,
}

impl PoolHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min, self.max)
    }

    /// Ask for `target` consumers; the value is clamped into [min, max].
    /// Returns the number of consumers not retiring afterwards.
    pub async fn scale(&self, target: usize) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Scale { target, reply })
            .await
            .map_err(|_| supervisor_gone())?;
        response.await.map_err(|_| supervisor_gone())
    }

    /// Cancel every consumer, drain in-flight work and wait for the pool
    /// to wind down.
    pub async fn stop(mut self) -> Result<ShutdownReport> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply })
            .await
            .map_err(|_| supervisor_gone())?;

        // Each consumer enforces the timeout itself; this bounds the whole.
        let limit = self.shutdown_timeout * 2 + Duration::from_secs(1);
        let report = tokio::time::timeout(limit, response)
            .await
            .map_err(|_| RabbitMQError::ShutdownTimeout(limit))?
            .map_err(|_| supervisor_gone())?;
        if let Some(task) = self.supervisor.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Consumer pool supervisor did not exit cleanly");
            }
        }
        Ok(report)
    }

    /// Consumers in any state but Stopped.
    pub fn consumer_count(&self) -> usize {
        lock_roster(&self.roster)
            .iter()
            .filter(|c| c.state() != ConsumerState::Stopped)
            .count()
    }

    /// Consumers currently subscribed and receiving.
    pub fn active_consumers(&self) -> usize {
        lock_roster(&self.roster)
            .iter()
            .filter(|c| c.state() == ConsumerState::Active)
            .count()
    }

    pub fn consumers(&self) -> Vec<ConsumerSnapshot> {
        lock_roster(&self.roster).iter().map(|c| c.snapshot()).collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Resolves when connection recovery has been given up for good.
    pub async fn fatal(&self) -> RabbitMQError {
        self.connection.wait_fatal().await
    }

    /// Poll until exactly `count` consumers are active.
    pub async fn wait_for_active(&self, count: usize, timeout: Duration) -> Result<()> {
        let waited = tokio::time::timeout(timeout, async {
            while self.active_consumers() != count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        waited.map_err(|_| {
            RabbitMQError::TimeoutError(format!(
                "{} of {} consumers active",
                self.active_consumers(),
                count
            ))
        })
    }
}

/// Indices of the `count` consumers to retire, given each slot's in-flight
/// load (`None` for slots already stopping). Least loaded go first, the
/// newest among equals.
fn pick_retirees(loads: &[Option<usize>], count: usize) -> Vec<usize> {
    let mut candidates: Vec<(usize, usize)> = loads
        .iter()
        .enumerate()
        .filter_map(|(index, load)| load.map(|load| (index, load)))
        .collect();
    candidates.sort_by_key(|&(index, load)| (load, Reverse(index)));
    candidates.into_iter().take(count).map(|(index, _)| index).collect()
}

fn supervisor_gone() -> RabbitMQError {
    RabbitMQError::ConsumeError("Consumer pool supervisor is not running".to_string())
}
