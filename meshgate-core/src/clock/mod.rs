//! Local time source
//!
//! Peers share no clock. Timeouts and cooldowns use the monotonic instant;
//! wall-clock milliseconds only appear in payloads (heartbeat timestamps,
//! registry `lastSeen`) where another peer needs a comparable value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    /// Monotonic local instant
    fn now(&self) -> Instant;

    /// Milliseconds since the Unix epoch
    fn unix_millis(&self) -> u64;
}

/// Real time. Wall-clock milliseconds are anchored once and then follow
/// tokio's instant, so paused-time tests see both views advance together.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    anchor: Instant,
    anchor_millis: u64,
}

impl SystemClock {
    pub fn new() -> Self {
        let anchor_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            anchor: Instant::now(),
            anchor_millis,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.anchor);
        self.anchor_millis + elapsed.as_millis() as u64
    }
}

/// Hand-advanced clock for deterministic tests
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    epoch_millis: u64,
    offset_millis: AtomicU64,
}

impl ManualClock {
    pub fn new(epoch_millis: u64) -> Self {
        Self {
            base: Instant::now(),
            epoch_millis,
            offset_millis: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.offset_millis.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z, an arbitrary but realistic epoch
        Self::new(1_704_067_200_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn unix_millis(&self) -> u64 {
        self.epoch_millis + self.offset_millis.load(Ordering::SeqCst)
    }
}
