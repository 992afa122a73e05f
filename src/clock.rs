//! Monotonic clock abstraction and scheduling-grid math.
//!
//! All scheduling arithmetic runs on monotonic milliseconds ([`MonoMs`])
//! measured from the clock's origin. Wall time never influences scheduling;
//! it only appears in event timestamps. The clock is injectable so planner
//! and engine behavior can be driven deterministically in tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::time::{Duration, Instant};

/// Grid resolution: firings are aligned to 500 ms cells.
pub const GRID_MS: u64 = 500;

/// Monotonic milliseconds since the clock's origin.
pub type MonoMs = u64;

/// Largest grid instant `<= t`.
pub fn grid_floor(t: MonoMs) -> MonoMs {
    t - t % GRID_MS
}

/// Smallest grid instant `>= t`.
pub fn grid_ceil(t: MonoMs) -> MonoMs {
    grid_floor(t + GRID_MS - 1)
}

/// The grid instant strictly after `t`.
pub fn next_grid(t: MonoMs) -> MonoMs {
    grid_floor(t) + GRID_MS
}

/// Monotonic time source.
///
/// `now_ms` must be non-decreasing across calls. `local_date` feeds the
/// daily component of deterministic planner seeds.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> MonoMs;

    /// Sleep until the given monotonic instant. Returns immediately if the
    /// deadline has already passed.
    async fn sleep_until(&self, deadline: MonoMs);

    /// Local calendar date, used for daily deterministic seeds.
    fn local_date(&self) -> NaiveDate;
}

/// Production clock anchored at a Tokio [`Instant`].
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now_ms(&self) -> MonoMs {
        self.origin.elapsed().as_millis() as MonoMs
    }

    async fn sleep_until(&self, deadline: MonoMs) {
        tokio::time::sleep_until(self.origin + Duration::from_millis(deadline)).await;
    }

    fn local_date(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// Fake clock for deterministic tests.
///
/// `sleep_until` jumps time forward instead of waiting, so scheduler code
/// that sleeps between operations advances the timeline itself.
pub struct FakeClock {
    now: Mutex<MonoMs>,
    date: NaiveDate,
}

impl FakeClock {
    pub fn new(start: MonoMs) -> Self {
        Self {
            now: Mutex::new(start),
            date: NaiveDate::default(),
        }
    }

    pub fn with_date(start: MonoMs, date: NaiveDate) -> Self {
        Self {
            now: Mutex::new(start),
            date,
        }
    }

    /// Advance fake time by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += delta_ms;
    }

    /// Jump fake time forward to `t`. Ignored if `t` is in the past.
    pub fn set(&self, t: MonoMs) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        if t > *now {
            *now = t;
        }
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now_ms(&self) -> MonoMs {
        *self.now.lock().expect("clock lock poisoned")
    }

    async fn sleep_until(&self, deadline: MonoMs) {
        self.set(deadline);
        // Stay cooperative: a loop driven by fake time must still let
        // sibling tasks run.
        tokio::task::yield_now().await;
    }

    fn local_date(&self) -> NaiveDate {
        self.date
    }
}
