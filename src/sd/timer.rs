use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of the current time for the discovery engine.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock { now: Arc::new(Mutex::new(Instant::now())) }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: Instant) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Longest delay a timer accepts: the largest SD TTL (0xFFFFFF seconds).
pub const MAX_DELAY: Duration = Duration::from_secs(0xFF_FFFF);

/// One-shot or periodic deadline owned by a state machine.
///
/// A timer does nothing by itself: the owner asks `fire(now)` whether it is due.
/// Periodic timers reschedule from their previous deadline so they never drift.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    deadline: Option<Instant>,
    period: Option<Duration>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays beyond [`MAX_DELAY`] are clamped to it.
    pub fn start(&mut self, now: Instant, delay: Duration, periodic: bool) {
        let delay = delay.min(MAX_DELAY);
        self.deadline = now.checked_add(delay);
        self.period = if periodic && !delay.is_zero() && self.deadline.is_some() { Some(delay) } else { None };
    }

    pub fn stop(&mut self) {
        self.deadline = None;
        self.period = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true when the timer expired at or before `now`, rearming periodic timers.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = self.period.and_then(|p| deadline.checked_add(p));
                true
            }
            _ => false,
        }
    }
}

/// Earliest of a set of optional deadlines.
pub fn earliest<I: IntoIterator<Item = Option<Instant>>>(deadlines: I) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_fires_once() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.start(t0, Duration::from_millis(50), false);

        assert!(!timer.fire(t0 + Duration::from_millis(49)));
        assert!(timer.fire(t0 + Duration::from_millis(50)));
        assert!(!timer.is_running());
        assert!(!timer.fire(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_periodic_rearms_from_deadline() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.start(t0, Duration::from_millis(100), true);

        assert!(timer.fire(t0 + Duration::from_millis(130)));
        assert_eq!(timer.deadline(), Some(t0 + Duration::from_millis(200)));
    }

    #[test]
    fn test_stopped_timer_never_fires() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.start(t0, Duration::ZERO, false);
        timer.stop();
        assert!(!timer.fire(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_zero_delay_is_due_immediately() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.start(t0, Duration::ZERO, true);
        assert!(timer.fire(t0));
        // a zero period cannot repeat
        assert!(!timer.is_running());
    }

    #[test]
    fn test_huge_delay_is_clamped() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.start(t0, Duration::MAX, true);
        assert_eq!(timer.deadline(), Some(t0 + MAX_DELAY));
        assert!(timer.fire(t0 + MAX_DELAY));
        assert_eq!(timer.deadline(), Some(t0 + MAX_DELAY + MAX_DELAY));
    }

    #[test]
    fn test_manual_clock_is_shared() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let start = clock.now();
        other.advance(Duration::from_millis(5));
        assert_eq!(clock.now(), start + Duration::from_millis(5));
    }

    #[test]
    fn test_earliest() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(1);
        assert_eq!(earliest([None, Some(t1), Some(t0)]), Some(t0));
        assert_eq!(earliest([None, None]), None);
    }
}
