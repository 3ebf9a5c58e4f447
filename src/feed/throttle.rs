//! Rate gates driven by the engine's tick. Nothing here spawns timers;
//! callers pass the current instant and poll.
use std::time::Duration;
use tokio::time::Instant;

/// Leading-edge throttle with a trailing fire.
///
/// The first request fires immediately. Requests inside the interval are
/// remembered and fire once, when [`Throttle::poll`] is called after the
/// interval elapsed. The caller keeps the latest value itself.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_fired: Option<Instant>,
    pending: bool,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: None,
            pending: false,
        }
    }

    /// Returns true when the caller should act now.
    pub fn request(&mut self, now: Instant) -> bool {
        if self.ready(now) {
            self.last_fired = Some(now);
            self.pending = false;
            true
        } else {
            self.pending = true;
            false
        }
    }

    /// Fire a deferred request once the interval has passed.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.pending && self.ready(now) {
            self.pending = false;
            self.last_fired = Some(now);
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn reset(&mut self) {
        self.last_fired = None;
        self.pending = false;
    }

    fn ready(&self, now: Instant) -> bool {
        self.last_fired
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }
}

/// Fires once the input has been quiet for `window`, or at the latest
/// `max_wait` after the first touch of a burst.
#[derive(Debug, Clone)]
pub struct Debounce {
    window: Duration,
    max_wait: Duration,
    first_touch: Option<Instant>,
    last_touch: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration, max_wait: Duration) -> Self {
        Self {
            window,
            max_wait: max_wait.max(window),
            first_touch: None,
            last_touch: None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.first_touch.get_or_insert(now);
        self.last_touch = Some(now);
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        let (Some(first), Some(last)) = (self.first_touch, self.last_touch) else {
            return false;
        };
        let quiet = now.saturating_duration_since(last) >= self.window;
        let overdue = now.saturating_duration_since(first) >= self.max_wait;
        if quiet || overdue {
            self.first_touch = None;
            self.last_touch = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.last_touch.is_some()
    }

    pub fn cancel(&mut self) {
        self.first_touch = None;
        self.last_touch = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_leading_then_trailing() {
        let start = Instant::now();
        let mut t = Throttle::new(Duration::from_millis(100));

        assert!(t.request(start));
        assert!(!t.request(start + Duration::from_millis(10)));
        assert!(!t.request(start + Duration::from_millis(20)));
        assert!(t.is_pending());

        assert!(!t.poll(start + Duration::from_millis(50)));
        assert!(t.poll(start + Duration::from_millis(100)));
        // The trailing fire consumed the pending request.
        assert!(!t.poll(start + Duration::from_millis(300)));
    }

    #[test]
    fn test_throttle_poll_without_request_does_nothing() {
        let mut t = Throttle::new(Duration::from_millis(100));
        assert!(!t.poll(Instant::now()));
    }

    #[test]
    fn test_debounce_waits_for_quiet() {
        let start = Instant::now();
        let mut d = Debounce::new(Duration::from_secs(1), Duration::from_secs(5));
        d.touch(start);
        d.touch(start + Duration::from_millis(600));

        assert!(!d.poll(start + Duration::from_millis(1200)));
        assert!(d.poll(start + Duration::from_millis(1600)));
        assert!(!d.is_armed());
    }

    #[test]
    fn test_debounce_max_wait_caps_a_steady_stream() {
        let start = Instant::now();
        let mut d = Debounce::new(Duration::from_secs(1), Duration::from_secs(3));
        for ms in (0..3000).step_by(500) {
            d.touch(start + Duration::from_millis(ms));
            assert!(!d.poll(start + Duration::from_millis(ms)));
        }
        assert!(d.poll(start + Duration::from_millis(3000)));
    }
}
