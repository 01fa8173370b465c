use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction to enforce deterministic time sourcing in core paths.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Monotonic instant used for keep-alive and staleness arithmetic.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the unix epoch, used for recorded timestamps.
    fn unix_millis(&self) -> u64;
}

/// System-backed clock; replaceable in tests or deterministic replay.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> u64 {
        unix_millis_now()
    }
}

/// Manually advanced clock for tests and replay harnesses.
///
/// Both the monotonic and the wall reading move together when [`ManualClock::advance`]
/// is called; nothing else moves them.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualInner>>,
}

struct ManualInner {
    base: Instant,
    base_wall_ms: u64,
    offset: Duration,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(unix_millis_now())
    }

    /// Start the wall reading at a fixed unix timestamp.
    pub fn starting_at(unix_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualInner {
                base: Instant::now(),
                base_wall_ms: unix_ms,
                offset: Duration::ZERO,
            })),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.offset = inner.offset.saturating_add(by);
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.lock().offset
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let inner = self.inner.lock();
        inner.base + inner.offset
    }

    fn unix_millis(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .base_wall_ms
            .saturating_add(inner.offset.as_millis() as u64)
    }
}

pub(crate) fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_both_readings() {
        let clock = ManualClock::starting_at(1_000);
        let start = clock.now();
        clock.advance(Duration::from_secs(16));
        assert_eq!(clock.now().duration_since(start), Duration::from_secs(16));
        assert_eq!(clock.unix_millis(), 17_000);
    }

    #[test]
    fn clones_share_the_same_timeline() {
        let clock = ManualClock::starting_at(0);
        let other = clock.clone();
        other.advance(Duration::from_millis(250));
        assert_eq!(clock.unix_millis(), 250);
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }
}
