//! Worker pools that pull tasks out of the store, one pool per command.

use crate::command::CommandRegistry;
use crate::lifecycle::{self, ClaimedTask};
use crate::throttle::{Lane, ThrottleRegistry};
use anyhow::Result;
use chrono::Utc;
use courier_config::{CommandOverride, Config};
use courier_storage::{Store, Task};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Release attempts for a claimed task whose outcome could not be recorded.
const GIVE_BACK_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Idle wait after a claim finds nothing eligible.
    pub poll_interval: Duration,
    /// Per-command policy overrides from `[commands.<name>]`.
    pub overrides: BTreeMap<String, CommandOverride>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            overrides: BTreeMap::new(),
        }
    }
}

impl DispatcherOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.scheduler.poll_interval_ms),
            overrides: config.commands.clone(),
        }
    }
}

pub struct Dispatcher {
    store: Store,
    options: DispatcherOptions,
}

impl Dispatcher {
    pub fn new(store: Store, options: DispatcherOptions) -> Self {
        Self { store, options }
    }

    /// Runs `concurrency` workers per registered command until `cancel`
    /// fires, then waits for all of them to exit.
    ///
    /// Rows left `running` by a previous process are recovered first.
    pub async fn start(&self, cancel: CancellationToken, registry: &CommandRegistry) -> Result<()> {
        if registry.is_empty() {
            warn!("No commands registered, dispatcher idle until shutdown");
            cancel.cancelled().await;
            return Ok(());
        }

        self.store.recover_running(Utc::now()).await?;

        let lanes = ThrottleRegistry::build(registry, &self.options.overrides);
        let mut workers = JoinSet::new();

        for lane in lanes.lanes() {
            let throttle = lane.config().throttle;
            info!(
                "Starting {} worker(s) for '{}' ({} request(s) per {:?})",
                throttle.concurrency,
                lane.name(),
                throttle.requests,
                throttle.period
            );
            for id in 0..throttle.concurrency {
                let worker = Worker {
                    id,
                    lane: Arc::clone(lane),
                    store: self.store.clone(),
                    poll_interval: self.options.poll_interval,
                    cancel: cancel.clone(),
                    in_hand: Mutex::new(None),
                };
                workers.spawn(worker.supervise());
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Dispatcher worker ended abnormally: {}", e);
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }
}

struct Worker {
    id: usize,
    lane: Arc<Lane>,
    store: Store,
    poll_interval: Duration,
    cancel: CancellationToken,
    /// Task claimed by this worker and not yet settled.
    in_hand: Mutex<Option<i64>>,
}

impl Worker {
    /// Restarts the loop after a panic until shutdown. A task the crashed
    /// loop was holding goes back to `pending`.
    async fn supervise(self) {
        let worker = Arc::new(self);
        loop {
            let runner = Arc::clone(&worker);
            match tokio::spawn(async move { runner.run().await }).await {
                Ok(()) => break,
                Err(e) => {
                    if let Some(id) = worker.take_in_hand() {
                        worker.give_back(id).await;
                    }
                    if worker.cancel.is_cancelled() {
                        break;
                    }
                    error!(
                        "Worker {}#{} crashed, restarting: {}",
                        worker.lane.name(),
                        worker.id,
                        e
                    );
                    if !worker.idle().await {
                        break;
                    }
                }
            }
        }
        debug!("Worker {}#{} exited", worker.lane.name(), worker.id);
    }

    async fn run(&self) {
        while !self.cancel.is_cancelled() {
            match self.claim().await {
                Ok(Some(task)) => self.process(task).await,
                Ok(None) => {
                    if !self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    error!("Claim failed for '{}': {:#}", self.lane.name(), e);
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }
    }

    async fn claim(&self) -> Result<Option<Task>> {
        let _permit = tokio::select! {
            permit = self.lane.claim_gate().acquire() => permit?,
            _ = self.cancel.cancelled() => return Ok(None),
        };
        self.store.claim_next(self.lane.name(), Utc::now()).await
    }

    /// False when shutdown interrupted the wait.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    async fn process(&self, task: Task) {
        let id = task.id;
        self.set_in_hand(Some(id));
        let reservation = self.lane.limiter().reserve();
        let delay = reservation.delay();
        if !delay.is_zero() {
            debug!(
                "Task {} ({}) waiting {:?} for rate limit",
                id,
                self.lane.name(),
                delay
            );
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                reservation.cancel();
                debug!("Task {} ({}) released on shutdown", id, self.lane.name());
                self.give_back(id).await;
                self.set_in_hand(None);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        if let Err(e) = lifecycle::run(&self.store, &self.lane, ClaimedTask::new(task)).await {
            error!("Task {} ({}) could not be settled: {:#}", id, self.lane.name(), e);
            self.give_back(id).await;
        }
        self.set_in_hand(None);
    }

    /// Returns a claimed task to `pending` without counting an attempt,
    /// retrying with linear backoff while the store keeps failing.
    async fn give_back(&self, id: i64) {
        for attempt in 1..=GIVE_BACK_ATTEMPTS {
            match self.store.release(id).await {
                Ok(_) => return,
                Err(e) if attempt < GIVE_BACK_ATTEMPTS => {
                    warn!(
                        "Releasing task {} ({}) failed (attempt {}): {:#}",
                        id,
                        self.lane.name(),
                        attempt,
                        e
                    );
                    tokio::time::sleep(self.poll_interval * attempt).await;
                }
                Err(e) => error!(
                    "Task {} ({}) stays running until the next restart: {:#}",
                    id,
                    self.lane.name(),
                    e
                ),
            }
        }
    }

    fn set_in_hand(&self, id: Option<i64>) {
        *self.in_hand.lock().unwrap_or_else(|e| e.into_inner()) = id;
    }

    fn take_in_hand(&self) -> Option<i64> {
        self.in_hand.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
