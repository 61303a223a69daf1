//! Test doubles shared by the scheduler's unit tests.

use crate::command::{Command, QueueConfig};
use anyhow::anyhow;
use async_trait::async_trait;
use courier_storage::{Store, Task, TaskStatus};
use courier_telegram::TelegramUpdate;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fail(&'static str),
    /// Sleeps, or stops early with an error when the token fires.
    Sleep(Duration),
    /// Panics on the first call, succeeds afterwards.
    PanicFirst,
    /// Fails every call; the first error classification panics.
    FailClassifierPanics(&'static str),
}

pub struct Scripted {
    name: String,
    behavior: Behavior,
    config: QueueConfig,
    soft_success: Option<&'static str>,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub starts: Mutex<Vec<Instant>>,
    pub cancelled: AtomicBool,
    pub classified: AtomicUsize,
}

impl Scripted {
    pub fn new(name: &str, behavior: Behavior) -> Arc<Self> {
        Self::with_config(name, behavior, QueueConfig::default())
    }

    pub fn with_config(name: &str, behavior: Behavior, config: QueueConfig) -> Arc<Self> {
        Arc::new(Self::build(name, behavior, config, None))
    }

    /// Succeeds, but reports errors containing `pattern` as soft successes.
    pub fn with_soft_success(name: &str, pattern: &'static str) -> Arc<Self> {
        Arc::new(Self::build(
            name,
            Behavior::Succeed,
            QueueConfig::default(),
            Some(pattern),
        ))
    }

    fn build(
        name: &str,
        behavior: Behavior,
        config: QueueConfig,
        soft_success: Option<&'static str>,
    ) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            config,
            soft_success,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            classified: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<Instant> {
        self.starts.lock().expect("starts lock").clone()
    }

    async fn behave(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(message) => Err(anyhow!(message)),
            Behavior::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Ok(()),
                    _ = cancel.cancelled() => {
                        self.cancelled.store(true, Ordering::SeqCst);
                        Err(anyhow!("cancelled"))
                    }
                }
            }
            Behavior::PanicFirst => {
                if self.calls() == 1 {
                    panic!("command '{}' blew up", self.name);
                }
                Ok(())
            }
            Behavior::FailClassifierPanics(message) => Err(anyhow!(message)),
        }
    }
}

#[async_trait]
impl Command for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue_config(&self) -> QueueConfig {
        self.config.clone()
    }

    async fn execute(&self, _update: TelegramUpdate, cancel: CancellationToken) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.starts.lock().expect("starts lock").push(Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.behave(cancel).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn is_soft_success(&self, err: &anyhow::Error) -> bool {
        let seen = self.classified.fetch_add(1, Ordering::SeqCst);
        if seen == 0 && matches!(self.behavior, Behavior::FailClassifierPanics(_)) {
            panic!("classifier for '{}' blew up", self.name);
        }
        self.soft_success
            .is_some_and(|pattern| err.to_string().contains(pattern))
    }
}

pub fn sample_update() -> TelegramUpdate {
    serde_json::from_value(serde_json::json!({
        "update_id": 1,
        "message": {
            "message_id": 10,
            "text": "/download https://example.com/clip",
            "chat": { "id": 99, "type": "private" },
            "from": { "id": 7, "username": "tester" }
        }
    }))
    .expect("sample update")
}

/// Polls the store until task `id` reaches `status`, panicking after `within`.
pub async fn wait_for_status(store: &Store, id: i64, status: TaskStatus, within: Duration) -> Task {
    let deadline = Instant::now() + within;
    loop {
        let task = store.get(id).await.expect("get").expect("task exists");
        if task.status == status {
            return task;
        }
        if Instant::now() >= deadline {
            panic!(
                "task {} stayed {} (wanted {}) for {:?}",
                id, task.status, status, within
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
