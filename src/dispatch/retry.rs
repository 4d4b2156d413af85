//! Retry backoff policies for the command pipeline's retry stage.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff, base_delay: Duration) -> Self {
        Self { max_retries, backoff, base_delay }
    }

    pub fn none() -> Self {
        Self { max_retries: 0, backoff: Backoff::Fixed, base_delay: Duration::from_millis(0) }
    }

    /// Delay before the `attempt`-th retry (`attempt` is 1-based: the delay
    /// before the first retry after the initial failed try).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay * attempt,
            Backoff::Exponential => self.base_delay.saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX)),
        }
    }
}
