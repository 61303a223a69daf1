use crate::command::Command;
use anyhow::{Context, Result};
use courier_config::CommandOverride;
use courier_storage::{NewTask, Store};
use courier_telegram::TelegramUpdate;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Producer side: snapshots updates into the store for later dispatch.
#[derive(Clone)]
pub struct TaskQueue {
    store: Store,
    overrides: BTreeMap<String, CommandOverride>,
}

impl TaskQueue {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            overrides: BTreeMap::new(),
        }
    }

    /// Applies `[commands.<name>]` overrides in [`TaskQueue::add_for`], so
    /// rows carry the same policy the dispatcher enforces.
    pub fn with_overrides(mut self, overrides: BTreeMap<String, CommandOverride>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn add(
        &self,
        command: &str,
        update: &TelegramUpdate,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<i64> {
        let payload = serde_json::to_vec(update)
            .with_context(|| format!("Failed to serialize update {}", update.update_id))?;
        let id = self
            .store
            .add(&NewTask {
                command: command.to_string(),
                payload,
                max_retries,
                retry_delay,
            })
            .await?;
        debug!(
            "Queued task {} for '{}' (update {})",
            id, command, update.update_id
        );
        Ok(id)
    }

    pub async fn add_for(&self, command: &dyn Command, update: &TelegramUpdate) -> Result<i64> {
        let mut config = command.queue_config();
        if let Some(over) = self.overrides.get(command.name()) {
            config = config.with_override(over);
        }
        self.add(command.name(), update, config.max_retries, config.retry_delay)
            .await
    }
}
