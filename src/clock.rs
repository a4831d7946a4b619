//! Clock abstraction
//!
//! The core never reaches for an ambient platform clock. Timestamps flow
//! in through a `Clock` handed to the sandbox at creation; tests supply a
//! manually advanced one.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Time source for the sandbox.
pub trait Clock {
    /// Milliseconds since sandbox creation (monotonic).
    fn monotonic_ms(&self) -> u64;

    /// Milliseconds since the Unix epoch (wall clock).
    fn wall_ms(&self) -> u64;

    /// Let `ms` milliseconds pass. The real clock blocks the thread; a
    /// manual clock jumps forward, keeping drive loops deterministic.
    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}

/// Default clock backed by `std::time::Instant`.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
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
    fn monotonic_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn wall_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests.
#[derive(Clone)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(0)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn monotonic_ms(&self) -> u64 {
        self.now.get()
    }

    fn wall_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.monotonic_ms(), 0);
        clock.advance(150);
        assert_eq!(clock.monotonic_ms(), 150);
    }

    #[test]
    fn test_monotonic_clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let a = clock.monotonic_ms();
        let b = clock.monotonic_ms();
        assert!(b >= a);
    }
}
