use std::time::{Duration, Instant};

/// Inactivity watchdog. Any inbox activity resets it, whether or not the
/// line mattered to the in-flight query: the engine interleaves diagnostic
/// chatter with query output and both count as proof of life.
#[derive(Debug, Clone)]
pub struct Watchdog {
    window: Duration,
    last_activity: Instant,
}

impl Watchdog {
    pub fn new(window: Duration) -> Self {
        Self::started_at(window, Instant::now())
    }

    pub fn started_at(window: Duration, now: Instant) -> Self {
        Self {
            window,
            last_activity: now,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn touch(&mut self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn is_stalled(&self) -> bool {
        self.is_stalled_at(Instant::now())
    }

    pub fn is_stalled_at(&self, now: Instant) -> bool {
        self.idle_for(now) > self.window
    }

    pub fn remaining(&self) -> Duration {
        self.remaining_at(Instant::now())
    }

    /// Time left before a stall is declared, zero once stalled.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.window.saturating_sub(self.idle_for(now))
    }

    /// How long the next inbox wait may block: the poll tick, shortened so
    /// the wait never overshoots the stall deadline by more than a tick.
    pub fn next_wait(&self, tick: Duration) -> Duration {
        let remaining = self.remaining();
        if remaining.is_zero() {
            Duration::from_millis(1)
        } else {
            tick.min(remaining)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_declared_only_after_window_of_silence() {
        let t0 = Instant::now();
        let dog = Watchdog::started_at(Duration::from_secs(30), t0);
        assert!(!dog.is_stalled_at(t0 + Duration::from_secs(29)));
        assert!(!dog.is_stalled_at(t0 + Duration::from_secs(30)));
        assert!(dog.is_stalled_at(t0 + Duration::from_secs(31)));
    }

    #[test]
    fn activity_resets_the_window() {
        let t0 = Instant::now();
        let mut dog = Watchdog::started_at(Duration::from_secs(30), t0);
        dog.touch_at(t0 + Duration::from_secs(25));
        assert!(!dog.is_stalled_at(t0 + Duration::from_secs(50)));
        assert_eq!(
            dog.remaining_at(t0 + Duration::from_secs(50)),
            Duration::from_secs(5)
        );
        assert!(dog.is_stalled_at(t0 + Duration::from_secs(56)));
    }

    #[test]
    fn touch_never_moves_backwards() {
        let t0 = Instant::now();
        let mut dog = Watchdog::started_at(Duration::from_secs(1), t0 + Duration::from_secs(10));
        dog.touch_at(t0);
        assert_eq!(dog.idle_for(t0 + Duration::from_secs(10)), Duration::ZERO);
    }

    #[test]
    fn next_wait_is_bounded_by_tick_and_deadline() {
        let dog = Watchdog::new(Duration::from_secs(30));
        assert_eq!(
            dog.next_wait(Duration::from_millis(250)),
            Duration::from_millis(250)
        );
        let short = Watchdog::new(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(
            short.next_wait(Duration::from_millis(250)),
            Duration::from_millis(1)
        );
    }
}
