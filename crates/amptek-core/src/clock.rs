//! Time source used for deadlines, acquisition waits and HV settling.
//!
//! Production code runs on [`SystemClock`]. Tests use [`ManualClock`], whose
//! `sleep` advances virtual time instantly, so a ten second acquisition
//! completes in microseconds.

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);

    /// Time left until `deadline`, zero once it has passed.
    fn remaining(&self, deadline: Instant) -> Duration {
        deadline.saturating_duration_since(self.now())
    }
}

/// Wall clock backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Simulated clock. `sleep` returns immediately after advancing time.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += duration;
    }

    /// Virtual time since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_secs(10));
        assert_eq!(clock.now() - start, Duration::from_secs(10));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_remaining_saturates() {
        let clock = ManualClock::new();
        let deadline = clock.now() + Duration::from_millis(300);
        assert_eq!(clock.remaining(deadline), Duration::from_millis(300));
        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.remaining(deadline), Duration::ZERO);
    }
}
