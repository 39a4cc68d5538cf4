//! Capped exponential backoff for cluster polling loops

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

/// Lower bound for the timeout handed to a single attempt.
const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(250);

/// Retry schedule: the delay starts at `initial_secs` and doubles every
/// attempt until it reaches `max_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_secs: u64,
    pub max_secs: u64,
    pub attempts: u32,
}

impl RetryPolicy {
    pub const fn new(initial_secs: u64, max_secs: u64, attempts: u32) -> Self {
        Self {
            initial_secs,
            max_secs,
            attempts,
        }
    }

    /// Schedule used while waiting for brokers.
    pub const fn brokers() -> Self {
        Self::new(2, 32, 20)
    }

    /// Schedule used while listing topics.
    pub const fn topics() -> Self {
        Self::new(10, 32, 10)
    }

    /// Iterate over the delays of this schedule.
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: Duration::from_secs(self.initial_secs),
            max: Duration::from_secs(self.max_secs.max(self.initial_secs)),
            remaining: self.attempts,
        }
    }

    /// Run `attempt` until `accept` approves its output or the schedule runs
    /// out.
    ///
    /// Each attempt receives the current delay as its timeout. Failed attempts
    /// wait out the rest of that delay before the next one starts, so slow
    /// attempts do not stretch the schedule.
    pub async fn run<T, F, Fut, A>(&self, what: &str, mut attempt: F, mut accept: A) -> Option<T>
    where
        F: FnMut(u32, Duration) -> Fut,
        Fut: Future<Output = T>,
        A: FnMut(u32, &T) -> bool,
    {
        let mut delays = self.delays().enumerate().peekable();
        while let Some((index, delay)) = delays.next() {
            let number = index as u32 + 1;
            let deadline = Instant::now() + delay;
            let value = attempt(number, delay.max(MIN_ATTEMPT_TIMEOUT)).await;
            if accept(number, &value) {
                return Some(value);
            }
            if delays.peek().is_none() {
                break;
            }
            let now = Instant::now();
            if deadline > now {
                info!(what, wait_ms = (deadline - now).as_millis() as u64, "Waiting to retry");
                tokio::time::sleep_until(deadline).await;
            }
        }
        None
    }
}

/// Iterator over backoff delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    remaining: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.next;
        self.next = (self.next * 2).min(self.max);
        Some(current)
    }
}
