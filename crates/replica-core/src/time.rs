//! Clock abstraction used for TTL stamping and expiry sweeps

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait TimeSource: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn current_time_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn current_time_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Default)]
pub struct FakeTimeSource {
    millis: AtomicI64,
}

impl FakeTimeSource {
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeSource for FakeTimeSource {
    fn current_time_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_time_source() {
        let clock = FakeTimeSource::new(1_000);
        clock.advance(500);
        assert_eq!(clock.current_time_millis(), 1_500);
        clock.set(10);
        assert_eq!(clock.current_time_millis(), 10);
    }

    #[test]
    fn test_system_time_is_after_2020() {
        assert!(SystemTimeSource.current_time_millis() > 1_577_836_800_000);
    }
}
