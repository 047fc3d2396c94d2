//! Clock abstractions for the client.
//!
//! Two clocks drive the protocol: an epoch clock in milliseconds for
//! agreeing on wall time with the driver (heartbeats, handshake deadlines)
//! and a monotonic nanosecond clock for pacing the conductor duty cycle.
//! Both are injectable so tests can run the protocol deterministically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use minstant::Instant;

/// Wall clock measured in milliseconds since the Unix epoch.
pub trait EpochClock: Send + Sync {
    /// Current epoch time in milliseconds.
    fn time_ms(&self) -> i64;
}

/// Monotonic clock measured in nanoseconds from an arbitrary origin.
///
/// Only differences between readings are meaningful.
pub trait NanoClock: Send + Sync {
    /// Current monotonic time in nanoseconds.
    fn nanos(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    fn time_ms(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_millis() as i64,
            // Clock before the epoch: clamp rather than panic.
            Err(_) => 0,
        }
    }
}

/// System monotonic clock, nanoseconds since clock construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemNanoClock {
    origin: Instant,
}

impl SystemNanoClock {
    /// Creates a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemNanoClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NanoClock for SystemNanoClock {
    fn nanos(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}

/// Hand-advanced clock for deterministic tests.
///
/// Implements both clock traits from a single pair of counters so a test
/// can march wall time and monotonic time together or independently.
#[derive(Debug, Default)]
pub struct ManualClock {
    epoch_ms: AtomicI64,
    monotonic_ns: AtomicI64,
}

impl ManualClock {
    /// Creates a clock starting at the given readings.
    #[must_use]
    pub fn new(epoch_ms: i64, monotonic_ns: i64) -> Self {
        Self {
            epoch_ms: AtomicI64::new(epoch_ms),
            monotonic_ns: AtomicI64::new(monotonic_ns),
        }
    }

    /// Advances both clocks by the given number of milliseconds.
    pub fn advance_ms(&self, ms: i64) {
        self.epoch_ms.fetch_add(ms, Ordering::Relaxed);
        self.monotonic_ns.fetch_add(ms * 1_000_000, Ordering::Relaxed);
    }

    /// Advances only the monotonic clock.
    pub fn advance_ns(&self, ns: i64) {
        self.monotonic_ns.fetch_add(ns, Ordering::Relaxed);
    }

    /// Sets the epoch reading directly.
    pub fn set_time_ms(&self, ms: i64) {
        self.epoch_ms.store(ms, Ordering::Relaxed);
    }
}

impl EpochClock for ManualClock {
    fn time_ms(&self) -> i64 {
        self.epoch_ms.load(Ordering::Relaxed)
    }
}

impl NanoClock for ManualClock {
    fn nanos(&self) -> i64 {
        self.monotonic_ns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_epoch_clock_is_recent() {
        // Anything after 2020-01-01 counts as sane.
        assert!(SystemEpochClock.time_ms() > 1_577_836_800_000);
    }

    #[test]
    fn system_nano_clock_is_monotonic() {
        let clock = SystemNanoClock::new();
        let a = clock.nanos();
        let b = clock.nanos();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances_together() {
        let clock = ManualClock::new(1_000, 0);
        clock.advance_ms(250);
        assert_eq!(clock.time_ms(), 1_250);
        assert_eq!(clock.nanos(), 250_000_000);
    }
}
