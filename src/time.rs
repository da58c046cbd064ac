//! Time source and cancellation deadline arithmetic

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Timeout value meaning "never time out"
pub const TIMEOUT_INFINITE: u32 = u32::MAX;

/// Absolute time split into whole seconds and sub-second milliseconds.
///
/// Ordering is lexicographic on `(seconds, millis)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TeeTime {
    pub seconds: u32,
    pub millis: u32,
}

impl TeeTime {
    /// Sentinel for a deadline that never expires
    pub const INFINITE: TeeTime = TeeTime {
        seconds: u32::MAX,
        millis: u32::MAX,
    };

    pub const fn new(seconds: u32, millis: u32) -> Self {
        Self { seconds, millis }
    }

    pub fn is_infinite(&self) -> bool {
        self.seconds == u32::MAX
    }

    /// Absolute deadline `timeout_ms` after `self`.
    ///
    /// Any overflow yields [`TeeTime::INFINITE`]; the result never wraps.
    pub fn deadline_after(self, timeout_ms: u32) -> TeeTime {
        if timeout_ms == TIMEOUT_INFINITE {
            return TeeTime::INFINITE;
        }

        let Some(mut seconds) = self.seconds.checked_add(timeout_ms / 1000) else {
            return TeeTime::INFINITE;
        };
        let mut millis = self.millis + timeout_ms % 1000;
        if millis >= 1000 {
            let Some(carried) = seconds.checked_add(1) else {
                return TeeTime::INFINITE;
            };
            seconds = carried;
            millis -= 1000;
        }

        // A finite deadline must not collide with the sentinel
        if seconds == u32::MAX {
            return TeeTime::INFINITE;
        }
        TeeTime { seconds, millis }
    }

    /// Whether the deadline `self` has been reached at `now`.
    pub fn has_passed(&self, now: TeeTime) -> bool {
        !self.is_infinite() && now >= *self
    }
}

/// Source of the current system time
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Result<TeeTime>;
}

/// Compute a cancellation deadline from a caller-relative timeout.
///
/// A failing clock yields an infinite deadline.
pub fn cancel_deadline(clock: &dyn TimeSource, timeout_ms: u32) -> TeeTime {
    if timeout_ms == TIMEOUT_INFINITE {
        return TeeTime::INFINITE;
    }
    match clock.now() {
        Ok(now) => now.deadline_after(timeout_ms),
        Err(e) => {
            tracing::debug!("Clock unavailable, using infinite deadline: {}", e);
            TeeTime::INFINITE
        }
    }
}

/// Wall-clock time source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> Result<TeeTime> {
        let now = chrono::Utc::now();
        let seconds = u32::try_from(now.timestamp())
            .map_err(|_| Error::BadState(format!("system time {} out of range", now)))?;
        Ok(TeeTime::new(seconds, now.timestamp_subsec_millis().min(999)))
    }
}

/// Manually driven time source
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Option<TeeTime>>,
}

impl ManualClock {
    pub fn new(start: TeeTime) -> Self {
        Self {
            now: Mutex::new(Some(start)),
        }
    }

    pub fn set(&self, time: TeeTime) {
        *self.now.lock() = Some(time);
    }

    /// Advance by `ms` milliseconds
    pub fn advance(&self, ms: u32) {
        let mut now = self.now.lock();
        if let Some(current) = *now {
            *now = Some(current.deadline_after(ms));
        }
    }

    /// Make subsequent reads fail
    pub fn fail(&self) {
        *self.now.lock() = None;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Result<TeeTime> {
        (*self.now.lock()).ok_or_else(|| Error::BadState("clock unavailable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_simple() {
        let now = TeeTime::new(100, 200);
        assert_eq!(now.deadline_after(1_500), TeeTime::new(101, 700));
        assert_eq!(now.deadline_after(0), now);
    }

    #[test]
    fn test_deadline_millis_carry() {
        let now = TeeTime::new(10, 900);
        assert_eq!(now.deadline_after(100), TeeTime::new(11, 0));
        assert_eq!(now.deadline_after(2_250), TeeTime::new(13, 150));
    }

    #[test]
    fn test_deadline_overflow_is_infinite() {
        let now = TeeTime::new(u32::MAX - 1, 999);
        assert!(now.deadline_after(1_000).is_infinite());
        assert!(now.deadline_after(1).is_infinite());
        assert!(TeeTime::new(5, 0).deadline_after(TIMEOUT_INFINITE).is_infinite());
    }

    #[test]
    fn test_has_passed() {
        let deadline = TeeTime::new(10, 500);
        assert!(!deadline.has_passed(TeeTime::new(10, 499)));
        assert!(deadline.has_passed(TeeTime::new(10, 500)));
        assert!(deadline.has_passed(TeeTime::new(11, 0)));
        assert!(!TeeTime::INFINITE.has_passed(TeeTime::new(u32::MAX - 1, 0)));
    }

    #[test]
    fn test_cancel_deadline_with_failing_clock() {
        let clock = ManualClock::new(TeeTime::new(1, 0));
        assert_eq!(cancel_deadline(&clock, 500), TeeTime::new(1, 500));

        clock.fail();
        assert!(cancel_deadline(&clock, 500).is_infinite());
    }

    #[test]
    fn test_system_clock() {
        let now = SystemClock.now().unwrap();
        assert!(now.seconds > 0);
        assert!(now.millis < 1000);
    }
}
