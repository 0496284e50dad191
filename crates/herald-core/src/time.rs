//! Clock abstraction for due-time queries, backoff and drain deadlines.
//!
//! Everything in Herald that reads "now" goes through [`Clock`] so tests can
//! freeze or advance time without sleeping.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic instant, used for deadlines and elapsed-time measurement.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for persisted timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the given duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Production clock backed by the operating system and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for deterministic tests.
///
/// Time only moves when [`TestClock::advance`] or [`TestClock::set_wall_time`]
/// is called (or through [`Clock::sleep`], which advances instead of
/// waiting). Clones share the same timeline.
#[derive(Clone)]
pub struct TestClock {
    origin: Instant,
    elapsed_ns: Arc<AtomicU64>,
    wall_ms: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a clock whose wall time starts at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a clock whose wall time starts at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            origin: Instant::now(),
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            wall_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Moves both monotonic and wall time forward.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.elapsed_ns.fetch_add(nanos, Ordering::AcqRel);
        self.wall_ms.fetch_add(millis, Ordering::AcqRel);
    }

    /// Sets wall time directly; monotonic time is unaffected.
    pub fn set_wall_time(&self, time: DateTime<Utc>) {
        self.wall_ms.store(time.timestamp_millis(), Ordering::Release);
    }

    /// Monotonic time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TestClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestClock")
            .field("elapsed", &self.elapsed())
            .field("wall_time", &self.now_utc())
            .finish()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        let millis = self.wall_ms.load(Ordering::Acquire);
        match u64::try_from(millis) {
            Ok(ms) => UNIX_EPOCH + Duration::from_millis(ms),
            Err(_) => UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs()),
        }
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn advance_moves_both_timelines() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = TestClock::starting_at(start);
        let before = clock.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(before), Duration::from_secs(90));
        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(90));
    }

    #[test]
    fn clones_share_a_timeline() {
        let clock = TestClock::new();
        let other = clock.clone();

        other.advance(Duration::from_secs(5));

        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn wall_time_can_jump_backwards() {
        let clock = TestClock::new();
        let earlier = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();

        clock.set_wall_time(earlier);

        assert_eq!(clock.now_utc(), earlier);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn sleep_advances_without_waiting() {
        let clock = TestClock::new();
        clock.sleep(Duration::from_secs(3600)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(3600));
    }
}
