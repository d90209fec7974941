use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Source of wall-clock time for timers and ages.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used by tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        if let Some(next) = chrono::Duration::from_std(by)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
        {
            *now = next;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// How the poller waits after finishing a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Sleep until the next tick.
    Sleep { until: Instant, remaining: Duration },
    /// The cycle ran past its tick; start the next one immediately.
    /// `skipped` whole ticks were dropped to realign with the grid.
    Overrun { late: Duration, skipped: u64 },
}

/// Fixed-rate tick arithmetic: cycle `n` is due by `anchor + n * interval`.
///
/// Targets are always derived from the anchor, so per-cycle sleep error
/// never accumulates.
#[derive(Debug, Clone)]
pub struct FixedRateSchedule {
    anchor: Instant,
    interval: Duration,
    cycle: u64,
}

impl FixedRateSchedule {
    pub fn new(anchor: Instant, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            bail!("interval must be > 0");
        }

        Ok(Self {
            anchor,
            interval,
            cycle: 1,
        })
    }

    /// The current cycle number, starting at 1.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Deadline of the given cycle.
    pub fn deadline(&self, cycle: u64) -> Instant {
        let nanos = self.interval.as_nanos().saturating_mul(u128::from(cycle));
        self.anchor + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Deadline of the current cycle.
    pub fn target(&self) -> Instant {
        self.deadline(self.cycle)
    }

    /// Close the current cycle at `now` and move to the next one.
    pub fn finish_cycle(&mut self, now: Instant) -> Pacing {
        let target = self.target();

        if now < target {
            self.cycle += 1;
            return Pacing::Sleep {
                until: target,
                remaining: target - now,
            };
        }

        let late = now - target;
        let skipped = u64::try_from(late.as_nanos() / self.interval.as_nanos()).unwrap_or(u64::MAX);
        self.cycle = self.cycle.saturating_add(1).saturating_add(skipped);
        Pacing::Overrun { late, skipped }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn test_schedule_rejects_zero_interval() {
        assert!(FixedRateSchedule::new(Instant::now(), Duration::ZERO).is_err());
    }

    #[test]
    fn test_deadlines_follow_anchor() {
        let anchor = Instant::now();
        let s = FixedRateSchedule::new(anchor, 60 * SEC).expect("valid");
        assert_eq!(s.cycle(), 1);
        assert_eq!(s.target(), anchor + 60 * SEC);
        assert_eq!(s.deadline(5), anchor + 300 * SEC);
    }

    #[test]
    fn test_finish_cycle_sleeps_remainder() {
        let anchor = Instant::now();
        let mut s = FixedRateSchedule::new(anchor, 60 * SEC).expect("valid");

        let pacing = s.finish_cycle(anchor + 12 * SEC);
        assert_eq!(
            pacing,
            Pacing::Sleep {
                until: anchor + 60 * SEC,
                remaining: 48 * SEC
            }
        );
        assert_eq!(s.cycle(), 2);

        // Work started late in cycle 2 still targets the grid, not now+interval.
        let pacing = s.finish_cycle(anchor + 100 * SEC);
        assert_eq!(
            pacing,
            Pacing::Sleep {
                until: anchor + 120 * SEC,
                remaining: 20 * SEC
            }
        );
    }

    #[test]
    fn test_overrun_realigns_without_burst() {
        let anchor = Instant::now();
        let mut s = FixedRateSchedule::new(anchor, 60 * SEC).expect("valid");

        // Cycle 1 ran for 150s: 90s past its tick, one whole tick skipped.
        let pacing = s.finish_cycle(anchor + 150 * SEC);
        assert_eq!(
            pacing,
            Pacing::Overrun {
                late: 90 * SEC,
                skipped: 1
            }
        );
        assert_eq!(s.cycle(), 3);
        assert!(s.target() > anchor + 150 * SEC);
    }

    #[test]
    fn test_overrun_exactly_on_tick() {
        let anchor = Instant::now();
        let mut s = FixedRateSchedule::new(anchor, 10 * SEC).expect("valid");
        let pacing = s.finish_cycle(anchor + 10 * SEC);
        assert_eq!(
            pacing,
            Pacing::Overrun {
                late: Duration::ZERO,
                skipped: 0
            }
        );
        assert_eq!(s.cycle(), 2);
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid date");
        let clock = ManualClock::new(start);
        clock.advance(90 * SEC);
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
