//! One attempt at a claimed task, from payload decode to the row's next state.

use crate::throttle::Lane;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use courier_storage::{Store, Task, TaskStatus};
use courier_telegram::TelegramUpdate;
use std::any::Any;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A task a worker owns, with its update decoded on first use.
pub struct ClaimedTask {
    task: Task,
    update: OnceLock<TelegramUpdate>,
}

impl ClaimedTask {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            update: OnceLock::new(),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn update(&self) -> Result<&TelegramUpdate, serde_json::Error> {
        if let Some(update) = self.update.get() {
            return Ok(update);
        }
        let decoded: TelegramUpdate = serde_json::from_slice(&self.task.payload)?;
        Ok(self.update.get_or_init(|| decoded))
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Where an attempt left the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    SoftSuccess,
    Retrying(DateTime<Utc>),
    Exhausted,
    /// The payload could not be decoded; failed without retry.
    Rejected,
}

pub async fn run(store: &Store, lane: &Lane, claimed: ClaimedTask) -> Result<Outcome> {
    let task = claimed.task();
    let update = match claimed.update() {
        Ok(update) => update.clone(),
        Err(err) => {
            error!(
                "Task {} ({}) has an undecodable payload, failing it: {}",
                task.id,
                lane.name(),
                err
            );
            store.mark_status(task.id, TaskStatus::Failed).await?;
            return Ok(Outcome::Rejected);
        }
    };

    store.mark_status(task.id, TaskStatus::Running).await?;
    debug!(
        "Executing task {} ({}), attempt {}/{}",
        task.id,
        lane.name(),
        task.retry_count + 1,
        task.max_retries
    );

    let result = execute(lane, update).await;
    settle(store, lane, task, result).await
}

/// Runs the command in its own tokio task so a panic stays contained, racing
/// it against the lane timeout. On timeout the command's token is cancelled
/// and the handle dropped; the command is expected to notice and stop.
pub async fn execute(lane: &Lane, update: TelegramUpdate) -> Result<(), ExecutionError> {
    let cancel = CancellationToken::new();
    let command = Arc::clone(lane.command());
    let token = cancel.clone();
    let mut handle = tokio::spawn(async move { command.execute(update, token).await });
    let timeout = lane.config().timeout;

    tokio::select! {
        joined = &mut handle => match joined {
            Ok(result) => result.map_err(ExecutionError::Failed),
            Err(err) if err.is_panic() => Err(ExecutionError::Panicked(panic_message(err.into_panic()))),
            Err(err) => Err(ExecutionError::Failed(anyhow!("command task aborted: {}", err))),
        },
        _ = tokio::time::sleep(timeout) => {
            cancel.cancel();
            Err(ExecutionError::TimedOut(timeout))
        }
    }
}

async fn settle(
    store: &Store,
    lane: &Lane,
    task: &Task,
    result: Result<(), ExecutionError>,
) -> Result<Outcome> {
    let err = match result {
        Ok(()) => {
            store.mark_status(task.id, TaskStatus::Complete).await?;
            info!("Task {} ({}) complete", task.id, lane.name());
            return Ok(Outcome::Completed);
        }
        Err(ExecutionError::Failed(err)) if lane.is_soft_success(&err) => {
            store.mark_status(task.id, TaskStatus::Complete).await?;
            info!(
                "Task {} ({}) complete, treating error as success: {:#}",
                task.id,
                lane.name(),
                err
            );
            return Ok(Outcome::SoftSuccess);
        }
        Err(err) => err,
    };

    match &err {
        ExecutionError::TimedOut(after) => warn!(
            "Task {} ({}) timed out after {:?}",
            task.id,
            lane.name(),
            after
        ),
        ExecutionError::Panicked(message) => error!(
            "Task {} ({}) panicked: {}",
            task.id,
            lane.name(),
            message
        ),
        ExecutionError::Failed(cause) => warn!(
            "Task {} ({}) failed: {:#}",
            task.id,
            lane.name(),
            cause
        ),
    }

    let attempts = task.retry_count.saturating_add(1);
    if attempts >= task.max_retries {
        store.exhaust(task.id).await?;
        error!(
            "Task {} ({}) failed permanently after {} attempt(s)",
            task.id,
            lane.name(),
            attempts
        );
        return Ok(Outcome::Exhausted);
    }

    let wait = lane.limiter().current_delay().max(task.retry_delay);
    let next_attempt = after_delay(Utc::now(), wait);
    store.reschedule(task.id, next_attempt).await?;
    info!(
        "Task {} ({}) will retry in {:?} ({}/{})",
        task.id,
        lane.name(),
        wait,
        attempts,
        task.max_retries
    );
    Ok(Outcome::Retrying(next_attempt))
}

fn after_delay(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
