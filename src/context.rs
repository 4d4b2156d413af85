//! Collaborator interfaces that would otherwise be reached for as global
//! singletons: clock, randomness, and a logging scope. Every component
//! takes a [`Context`] instead of calling out to ambient statics.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

/// The Clock collaborator required by : a monotonic clock for timers and
/// deadlines, and a wall clock for audit/event timestamps only. The core
/// never uses wall time for ordering decisions.
pub trait Clock: Send + Sync + 'static {
    fn monotonic_now(&self) -> Instant;
    fn wall_now(&self) -> SystemTime;
}

/// The default `Clock` backed by the OS clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A thread-safe, seedable RNG handle, used for election-timeout jitter and
/// weighted read-replica selection. Kept behind a mutex rather than
/// thread-local so that a deterministic seed can make tests reproducible.
pub struct Entropy {
    inner: Mutex<StdRng>,
}

impl Entropy {
    pub fn from_os() -> Self {
        Self {
            inner: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn from_seed(seed: u64) -> Self {
        Self {
            inner: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn gen_range_ms(&self, range: std::ops::Range<u64>) -> Duration {
        let mut rng = self.inner.lock();
        Duration::from_millis(rng.gen_range(range))
    }

    pub fn gen_f64(&self) -> f64 {
        self.inner.lock().gen::<f64>()
    }

    pub fn gen_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.inner.lock().gen_range(0..len)
    }
}

/// Bundles the non-domain collaborators that each component needs:
/// a clock and an entropy source. Logging uses `tracing`'s ambient
/// subscriber directly, scoped per-call with `#[tracing::instrument]`
/// rather than threaded through `Context` — only clock and RNG are true
/// hidden-global risks worth carrying explicitly.
#[derive(Clone)]
pub struct Context {
    pub clock: Arc<dyn Clock>,
    pub entropy: Arc<Entropy>,
}

impl Context {
    pub fn new(clock: Arc<dyn Clock>, entropy: Arc<Entropy>) -> Self {
        Self { clock, entropy }
    }

    pub fn system() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            entropy: Arc::new(Entropy::from_os()),
        }
    }
}
