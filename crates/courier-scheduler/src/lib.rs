//! Courier Scheduler
//!
//! Persistent per-command task scheduling: bot commands enqueue updates
//! through [`TaskQueue`], and the [`Dispatcher`] runs them later under each
//! command's rate limit, concurrency, timeout and retry policy.

mod command;
mod dispatcher;
mod lifecycle;
mod queue;
mod throttle;

#[cfg(test)]
mod testing;

pub use command::{Command, CommandRegistry, QueueConfig, RegistryError, Throttle};
pub use dispatcher::{Dispatcher, DispatcherOptions};
pub use lifecycle::{ClaimedTask, ExecutionError, Outcome};
pub use queue::TaskQueue;
pub use throttle::{Lane, RateLimiter, Reservation, ThrottleRegistry};
