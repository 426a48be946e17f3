//! Clock capability.
//!
//! Time enters the engine in two places: creation stamps on data files and
//! the day-rollover boundary that retires old files from append candidacy.
//! Both go through the [`Clock`] trait so tests can control them.

use chrono::{Local, TimeZone};
use std::sync::Arc;

/// Source of the current time, in epoch seconds.
pub trait Clock: Send + Sync {
    /// Returns the current time as epoch seconds.
    fn now(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Local::now().timestamp()
    }
}

/// Returns the epoch-seconds stamp of local midnight `days - 1` days ago.
///
/// Data files created before this stamp are no longer append candidates.
/// `days == 0` disables the age cutoff and returns 0.
#[must_use]
pub fn day_begin_stamp(clock: &Arc<dyn Clock>, days: u32) -> i64 {
    if days == 0 {
        return 0;
    }

    let now = match Local.timestamp_opt(clock.now(), 0).single() {
        Some(t) => t,
        None => return 0,
    };
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|t| Local.from_local_datetime(&t).single());
    match midnight {
        Some(m) => m.timestamp() - 3600 * 24 * i64::from(days - 1),
        None => 0,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Clock;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Manually advanced clock for tests.
    pub struct ManualClock {
        now: AtomicI64,
    }

    impl ManualClock {
        pub fn new(now: i64) -> Self {
            Self {
                now: AtomicI64::new(now),
            }
        }

        pub fn set(&self, now: i64) {
            self.now.store(now, Ordering::Relaxed);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> i64 {
            self.now.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_days_disables_cutoff() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        assert_eq!(day_begin_stamp(&clock, 0), 0);
    }

    #[test]
    fn test_stamp_moves_back_one_day_per_unit() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let one = day_begin_stamp(&clock, 1);
        let seven = day_begin_stamp(&clock, 7);
        assert_eq!(one - seven, 3600 * 24 * 6);
        assert!(one <= clock.now());
    }
}
