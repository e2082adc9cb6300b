//! # Tick Sources
//!
//! The dispatcher schedules delayed messages against a free-running 32-bit
//! millisecond counter that wraps roughly every 49.7 days. The counter must
//! never go backward except at that wrap.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A monotonic, wrapping millisecond counter.
pub trait TickSource: Send + 'static {
    fn now(&self) -> u32;
}

/// Milliseconds elapsed since construction, added to a starting value and
/// truncated to 32 bits.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
    base: u32,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// A clock whose first reading is `base`. Starting close to `u32::MAX`
    /// makes the counter wrap within milliseconds.
    pub fn starting_at(base: u32) -> Self {
        Self {
            origin: Instant::now(),
            base,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for SystemClock {
    fn now(&self) -> u32 {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.base.wrapping_add(elapsed as u32)
    }
}

/// A clock that only moves when told to. Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    ticks: Arc<AtomicU32>,
}

impl ManualClock {
    pub fn new(start: u32) -> Self {
        Self {
            ticks: Arc::new(AtomicU32::new(start)),
        }
    }

    pub fn set(&self, ticks: u32) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    /// Advance by `delta`, wrapping at `u32::MAX`. Returns the new reading.
    pub fn advance(&self, delta: u32) -> u32 {
        self.ticks
            .fetch_add(delta, Ordering::SeqCst)
            .wrapping_add(delta)
    }
}

impl TickSource for ManualClock {
    fn now(&self) -> u32 {
        self.ticks.load(Ordering::SeqCst)
    }
}
