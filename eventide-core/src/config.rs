//! Store and command configuration.
//!
//! Durations are written in human-readable form (`"250ms"`, `"5s"`) when
//! deserialized.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings applied by [`EventStore`](crate::store::EventStore) to every
/// operation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Upper bound for each store operation. For history streams the bound
    /// applies to each element. `None` waits indefinitely.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Option<Duration>,
}

impl StoreConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            operation_timeout: None,
        }
    }

    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }
}

/// How [`EventStore::execute_with_retry`](crate::store::EventStore::execute_with_retry)
/// reacts to concurrency conflicts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Pause before each retry.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
