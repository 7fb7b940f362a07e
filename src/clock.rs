use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of millisecond timestamps.
///
/// The graveyard and the retry loops only need a monotonic-enough millisecond
/// counter; tests swap in [`ManualClock`] to drive expiry deterministically.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the UNIX epoch.
    fn now_millis(&self) -> u64;
}

fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall clock via `SystemTime`. Subject to NTP adjustments.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        wall_millis()
    }
}

/// TSC-backed clock anchored to the wall clock at construction; never goes backwards.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall_ms: u64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        Self {
            clock,
            start_wall_ms: wall_millis(),
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now_millis(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ms + delta.as_millis() as u64
    }
}

/// Hand-advanced clock for tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
