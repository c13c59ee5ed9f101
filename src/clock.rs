//! Time source for lease arithmetic.
//!
//! Lease expiry is a predicate evaluated against "now" at every operation, so
//! the lease manager and selector take their time from an injected [`Clock`].
//! Production uses [`SystemClock`]; tests drive a [`ManualClock`] forward to
//! expire leases without sleeping.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::model::UnixTimeMs;

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Virtual clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(start.0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: UnixTimeMs) {
        self.now_ms.store(to.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new(UnixTimeMs(1_000));
        assert_eq!(clock.now(), UnixTimeMs(1_000));
        clock.advance(Duration::from_secs(601));
        assert_eq!(clock.now(), UnixTimeMs(602_000));
        clock.set(UnixTimeMs(5));
        assert_eq!(clock.now(), UnixTimeMs(5));
    }

    #[test]
    fn system_clock_is_past_2020() {
        assert!(SystemClock.now().0 > 1_577_836_800_000);
    }
}
