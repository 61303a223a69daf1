//! The contract every deferred bot command implements, and the registry the
//! dispatcher reads lanes from.

use async_trait::async_trait;
use courier_config::CommandOverride;
use courier_telegram::TelegramUpdate;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Admission limits for one command: `requests` per `period`, at most
/// `concurrency` executions at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    pub period: Duration,
    pub requests: u32,
    pub concurrency: usize,
}

impl Default for Throttle {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            requests: 1,
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub throttle: Throttle,
    /// Error substrings meaning the side effect already happened.
    pub soft_success: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
            timeout: Duration::from_secs(300),
            throttle: Throttle::default(),
            soft_success: Vec::new(),
        }
    }
}

impl QueueConfig {
    pub fn with_override(mut self, over: &CommandOverride) -> Self {
        if let Some(max_retries) = over.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(ms) = over.retry_delay_ms {
            self.retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = over.timeout_secs {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = over.period_ms {
            self.throttle.period = Duration::from_millis(ms);
        }
        if let Some(requests) = over.requests {
            self.throttle.requests = requests;
        }
        if let Some(concurrency) = over.concurrency {
            self.throttle.concurrency = concurrency;
        }
        for pattern in &over.soft_success {
            if !self.soft_success.contains(pattern) {
                self.soft_success.push(pattern.clone());
            }
        }
        self
    }

    /// Clamps values a lane cannot run with: no workers, no tokens, or a
    /// zero timeout that would fail every execution.
    pub(crate) fn normalized(mut self) -> Self {
        self.throttle.requests = self.throttle.requests.max(1);
        self.throttle.concurrency = self.throttle.concurrency.max(1);
        if self.throttle.period.is_zero() {
            self.throttle.period = Duration::from_millis(1);
        }
        if self.timeout.is_zero() {
            self.timeout = QueueConfig::default().timeout;
        }
        self
    }
}

/// A bot command whose work runs on the scheduler instead of the update loop.
#[async_trait]
pub trait Command: Send + Sync {
    /// Queue lane name. Tasks are stored and claimed under it.
    fn name(&self) -> &str;

    fn queue_config(&self) -> QueueConfig {
        QueueConfig::default()
    }

    /// Runs one task. `cancel` fires when the scheduler gives up on this
    /// attempt (timeout); long operations should stop when it does.
    async fn execute(&self, update: TelegramUpdate, cancel: CancellationToken)
        -> anyhow::Result<()>;

    /// Failures whose effect already happened, e.g. deleting a message that
    /// is already gone. Matching errors complete the task instead of retrying.
    fn is_soft_success(&self, _err: &anyhow::Error) -> bool {
        false
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command name cannot be empty")]
    EmptyName,

    #[error("command name '{0}' has surrounding whitespace")]
    PaddedName(String),

    #[error("duplicate command '{0}'")]
    Duplicate(String),
}

/// Registered commands by name. Built once, read-only while dispatching.
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The name is used verbatim as the store's `command` column, so it must
    /// not carry surrounding whitespace.
    pub fn register(&mut self, command: Arc<dyn Command>) -> Result<(), RegistryError> {
        let name = command.name().to_string();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if name.trim() != name {
            return Err(RegistryError::PaddedName(name));
        }
        if self.commands.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.commands.insert(name, command);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Command>> {
        self.commands.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Command>)> {
        self.commands.iter().map(|(name, cmd)| (name.as_str(), cmd))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behavior, Scripted};

    #[test]
    fn register_rejects_duplicates_and_empty_names() {
        let mut registry = CommandRegistry::new();
        registry
            .register(Scripted::new("ai", Behavior::Succeed))
            .expect("first registration");

        assert_eq!(
            registry.register(Scripted::new("ai", Behavior::Succeed)),
            Err(RegistryError::Duplicate("ai".to_string()))
        );
        assert_eq!(
            registry.register(Scripted::new(" ", Behavior::Succeed)),
            Err(RegistryError::EmptyName)
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get("ai").is_some());
    }

    #[test]
    fn register_rejects_padded_names() {
        let mut registry = CommandRegistry::new();
        assert_eq!(
            registry.register(Scripted::new(" download", Behavior::Succeed)),
            Err(RegistryError::PaddedName(" download".to_string()))
        );
        assert_eq!(
            registry.register(Scripted::new("img\n", Behavior::Succeed)),
            Err(RegistryError::PaddedName("img\n".to_string()))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn override_replaces_only_set_fields() {
        let declared = QueueConfig {
            soft_success: vec!["not found".to_string()],
            ..QueueConfig::default()
        };
        let merged = declared.with_override(&CommandOverride {
            max_retries: Some(7),
            concurrency: Some(4),
            soft_success: vec!["not found".to_string(), "already deleted".to_string()],
            ..CommandOverride::default()
        });

        assert_eq!(merged.max_retries, 7);
        assert_eq!(merged.throttle.concurrency, 4);
        assert_eq!(merged.throttle.requests, 1);
        assert_eq!(merged.retry_delay, Duration::from_secs(60));
        assert_eq!(merged.soft_success, vec!["not found", "already deleted"]);
    }

    #[test]
    fn normalized_clamps_unusable_values() {
        let cfg = QueueConfig {
            timeout: Duration::ZERO,
            throttle: Throttle {
                period: Duration::ZERO,
                requests: 0,
                concurrency: 0,
            },
            ..QueueConfig::default()
        }
        .normalized();

        assert_eq!(cfg.throttle.requests, 1);
        assert_eq!(cfg.throttle.concurrency, 1);
        assert!(!cfg.throttle.period.is_zero());
        assert_eq!(cfg.timeout, QueueConfig::default().timeout);
    }
}
