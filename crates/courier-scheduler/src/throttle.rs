//! Per-command admission control.
//!
//! Each command gets a [`Lane`]: a token-bucket [`RateLimiter`] for the
//! request rate and a claim gate sized to the command's concurrency.
//!
//! The claim gate is not a concurrency limiter. It only serializes how many
//! workers of one lane hit the store with `claim_next` at the same time, and
//! is released as soon as the claim returns. Concurrent executions are
//! bounded by the number of workers the dispatcher spawns for the lane, each
//! of which runs one task at a time.

use crate::command::{Command, CommandRegistry, QueueConfig};
use courier_config::CommandOverride;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::warn;

/// Token bucket: burst of `requests`, one token back every `period / requests`.
pub struct RateLimiter {
    interval: Duration,
    burst: u32,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    updated: Instant,
}

impl RateLimiter {
    pub fn new(period: Duration, requests: u32) -> Self {
        let burst = requests.max(1);
        Self {
            interval: period / burst,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                updated: Instant::now(),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Takes a token now, even if that leaves the bucket in debt; the
    /// returned reservation says how long to wait before acting on it.
    pub fn reserve(self: &Arc<Self>) -> Reservation {
        let delay = self.with_bucket(|bucket, interval| {
            bucket.tokens -= 1.0;
            debt_delay(bucket.tokens, interval)
        });
        Reservation {
            limiter: Arc::clone(self),
            delay,
        }
    }

    /// Wait until a token would be available, without taking one.
    pub fn current_delay(&self) -> Duration {
        self.with_bucket(|bucket, interval| debt_delay(bucket.tokens - 1.0, interval))
    }

    fn restore(&self) {
        let burst = f64::from(self.burst);
        self.with_bucket(|bucket, _| bucket.tokens = (bucket.tokens + 1.0).min(burst));
    }

    fn with_bucket<T>(&self, f: impl FnOnce(&mut Bucket, Duration) -> T) -> T {
        let mut bucket = self
            .bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.updated);
        let refill = if self.interval.is_zero() {
            f64::from(self.burst)
        } else {
            elapsed.as_secs_f64() / self.interval.as_secs_f64()
        };
        bucket.tokens = (bucket.tokens + refill).min(f64::from(self.burst));
        bucket.updated = now;

        f(&mut bucket, self.interval)
    }
}

fn debt_delay(balance: f64, interval: Duration) -> Duration {
    if balance >= 0.0 {
        Duration::ZERO
    } else {
        interval.mul_f64(-balance)
    }
}

/// A token taken from a [`RateLimiter`].
#[must_use = "a reservation holds a token until it is used or cancelled"]
pub struct Reservation {
    limiter: Arc<RateLimiter>,
    delay: Duration,
}

impl Reservation {
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Gives the token back when the caller walks away before using it.
    pub fn cancel(self) {
        self.limiter.restore();
    }
}

/// Everything the workers of one command share.
pub struct Lane {
    command: Arc<dyn Command>,
    config: QueueConfig,
    limiter: Arc<RateLimiter>,
    claim_gate: Semaphore,
}

impl Lane {
    pub fn new(command: Arc<dyn Command>, config: QueueConfig) -> Self {
        let config = config.normalized();
        let limiter = Arc::new(RateLimiter::new(
            config.throttle.period,
            config.throttle.requests,
        ));
        let claim_gate = Semaphore::new(config.throttle.concurrency);
        Self {
            command,
            config,
            limiter,
            claim_gate,
        }
    }

    pub fn name(&self) -> &str {
        self.command.name()
    }

    pub fn command(&self) -> &Arc<dyn Command> {
        &self.command
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub(crate) fn claim_gate(&self) -> &Semaphore {
        &self.claim_gate
    }

    /// Command predicate first, then configured substrings against the full
    /// error chain.
    pub fn is_soft_success(&self, err: &anyhow::Error) -> bool {
        if self.command.is_soft_success(err) {
            return true;
        }
        if self.config.soft_success.is_empty() {
            return false;
        }
        let message = format!("{:#}", err);
        self.config
            .soft_success
            .iter()
            .any(|pattern| message.contains(pattern.as_str()))
    }
}

/// Lanes keyed by command name, built once when dispatching starts.
pub struct ThrottleRegistry {
    lanes: BTreeMap<String, Arc<Lane>>,
}

impl ThrottleRegistry {
    pub fn build(
        registry: &CommandRegistry,
        overrides: &BTreeMap<String, CommandOverride>,
    ) -> Self {
        for name in overrides.keys() {
            if registry.get(name).is_none() {
                warn!("Queue override for unknown command '{}' ignored", name);
            }
        }

        let lanes = registry
            .iter()
            .map(|(name, command)| {
                let mut config = command.queue_config();
                if let Some(over) = overrides.get(name) {
                    config = config.with_override(over);
                }
                let lane = Lane::new(Arc::clone(command), config);
                (name.to_string(), Arc::new(lane))
            })
            .collect();

        Self { lanes }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Lane>> {
        self.lanes.get(name)
    }

    pub fn lanes(&self) -> impl Iterator<Item = &Arc<Lane>> {
        self.lanes.values()
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Throttle;
    use crate::testing::{Behavior, Scripted};

    #[tokio::test(start_paused = true)]
    async fn burst_is_free_then_tokens_are_spaced() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(10), 2));
        assert_eq!(limiter.interval(), Duration::from_secs(5));

        assert_eq!(limiter.reserve().delay(), Duration::ZERO);
        assert_eq!(limiter.reserve().delay(), Duration::ZERO);
        assert_eq!(limiter.reserve().delay(), Duration::from_secs(5));
        assert_eq!(limiter.reserve().delay(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_over_time() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(10), 1));
        let _first = limiter.reserve();
        assert_eq!(limiter.current_delay(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(limiter.current_delay(), Duration::from_secs(6));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(limiter.current_delay(), Duration::ZERO);
        assert_eq!(limiter.reserve().delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_burst() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(1), 2));
        tokio::time::advance(Duration::from_secs(60)).await;

        let _a = limiter.reserve();
        let _b = limiter.reserve();
        assert_eq!(limiter.reserve().delay(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn current_delay_does_not_consume() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(10), 1));
        assert_eq!(limiter.current_delay(), Duration::ZERO);
        assert_eq!(limiter.current_delay(), Duration::ZERO);
        assert_eq!(limiter.reserve().delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reservation_returns_its_token() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(10), 1));
        let _used = limiter.reserve();

        let abandoned = limiter.reserve();
        assert_eq!(abandoned.delay(), Duration::from_secs(10));
        abandoned.cancel();

        assert_eq!(limiter.reserve().delay(), Duration::from_secs(10));
    }

    #[test]
    fn registry_applies_overrides_per_command() {
        let mut commands = CommandRegistry::new();
        commands
            .register(Scripted::with_config(
                "download",
                Behavior::Succeed,
                QueueConfig {
                    throttle: Throttle {
                        period: Duration::from_secs(10),
                        requests: 1,
                        concurrency: 1,
                    },
                    ..QueueConfig::default()
                },
            ))
            .expect("register");
        commands
            .register(Scripted::new("ai", Behavior::Succeed))
            .expect("register");

        let mut overrides = BTreeMap::new();
        overrides.insert(
            "download".to_string(),
            CommandOverride {
                concurrency: Some(3),
                ..CommandOverride::default()
            },
        );
        overrides.insert("missing".to_string(), CommandOverride::default());

        let throttles = ThrottleRegistry::build(&commands, &overrides);
        assert_eq!(throttles.len(), 2);

        let download = throttles.get("download").expect("download lane");
        assert_eq!(download.config().throttle.concurrency, 3);
        assert_eq!(download.config().throttle.period, Duration::from_secs(10));
        assert_eq!(download.claim_gate().available_permits(), 3);

        let ai = throttles.get("ai").expect("ai lane");
        assert_eq!(ai.config(), &QueueConfig::default());
        assert!(throttles.get("missing").is_none());
    }

    #[test]
    fn soft_success_matches_predicate_or_patterns() {
        let lane = Lane::new(
            Scripted::with_soft_success("cleanup", "message to delete not found"),
            QueueConfig {
                soft_success: vec!["chat not found".to_string()],
                ..QueueConfig::default()
            },
        );

        let predicate = anyhow::anyhow!("Bad Request: message to delete not found");
        let pattern = anyhow::anyhow!("Bad Request: chat not found").context("deleteMessage");
        let other = anyhow::anyhow!("Too Many Requests: retry after 5");

        assert!(lane.is_soft_success(&predicate));
        assert!(lane.is_soft_success(&pattern));
        assert!(!lane.is_soft_success(&other));
    }
}
