//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Monotonic time sources for budget enforcement
//!
//! The scheduler never reads the system clock directly. It asks a [`Clock`]
//! for the time elapsed since the clock's origin, which lets a host drive
//! scheduling from its own time base and lets tests advance time by hand.
//!
//! # Example
//!
//! ```rust
//! use idle_pulse::clock::{Clock, ManualClock};
//! use std::time::Duration;
//!
//! let clock = ManualClock::new();
//! let start = clock.now();
//! clock.advance(Duration::from_millis(5));
//! assert_eq!(clock.now() - start, Duration::from_millis(5));
//! ```

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source
///
/// Readings are offsets from an arbitrary per-clock origin and never go
/// backwards.
pub trait Clock: Send + Sync {
    /// Time elapsed since this clock's origin
    fn now(&self) -> Duration;

    /// Implementation name, for logs
    fn name(&self) -> &'static str;
}

/// Wall-clock time via `std::time::Instant`
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Clock whose origin is now
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn name(&self) -> &'static str {
        "monotonic (Instant)"
    }
}

/// Hand-driven clock
///
/// Clones share the same reading, so a unit's action can hold a clone and
/// advance time by its simulated cost.
#[derive(Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    /// Clock stopped at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Jumps to an absolute reading; ignored if it would move time backwards
    pub fn set(&self, to: Duration) {
        let nanos = u64::try_from(to.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_max(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock").field("now", &self.now()).finish()
    }
}

/// Default clock for a scheduler
#[must_use]
pub fn default_clock() -> Arc<dyn Clock> {
    Arc::new(MonotonicClock::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let mut previous = clock.now();

        for _ in 0..1000 {
            let current = clock.now();
            assert!(current >= previous, "Time went backwards: {:?} < {:?}", current, previous);
            previous = current;
        }
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new();
        let handle = clock.clone();

        handle.advance(Duration::from_millis(3));
        assert_eq!(clock.now(), Duration::from_millis(3));

        clock.set(Duration::from_millis(10));
        assert_eq!(handle.now(), Duration::from_millis(10));

        // Setting into the past is ignored
        clock.set(Duration::from_millis(1));
        assert_eq!(clock.now(), Duration::from_millis(10));
    }

    #[test]
    fn test_default_clock() {
        let clock = default_clock();
        assert!(!clock.name().is_empty());
    }
}
