//! A manually-advanceable [`Clock`] fake so timing-sensitive tests (election
//! timeouts, retry backoff, saga timeouts) don't depend on wall-clock
//! sleeps.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;

use crate::context::Clock;

pub struct TestClock {
    base_monotonic: Instant,
    base_wall: SystemTime,
    offset_ms: AtomicI64,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClock {
    pub fn new() -> Self {
        Self { base_monotonic: Instant::now(), base_wall: SystemTime::now(), offset_ms: AtomicI64::new(0) }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    fn offset(&self) -> Duration {
        Duration::from_millis(self.offset_ms.load(Ordering::SeqCst).max(0) as u64)
    }
}

impl Clock for TestClock {
    fn monotonic_now(&self) -> Instant {
        self.base_monotonic + self.offset()
    }

    fn wall_now(&self) -> SystemTime {
        self.base_wall + self.offset()
    }
}
