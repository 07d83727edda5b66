//! Idle-exit predicate for the worker loop.

use std::time::{Duration, Instant};

/// True once no claim has succeeded for at least `idle_threshold`.
///
/// The worker threads `last_claim` explicitly through its loop so this stays
/// a pure function of its arguments rather than hidden mutable state.
pub fn idle_exceeded(now: Instant, last_claim: Instant, idle_threshold: Duration) -> bool {
    now.saturating_duration_since(last_claim) >= idle_threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_window_keeps_polling() {
        let start = Instant::now();
        assert!(!idle_exceeded(
            start + Duration::from_secs(10),
            start,
            Duration::from_secs(15)
        ));
    }

    #[test]
    fn at_and_past_window_exits() {
        let start = Instant::now();
        assert!(idle_exceeded(
            start + Duration::from_secs(15),
            start,
            Duration::from_secs(15)
        ));
        assert!(idle_exceeded(
            start + Duration::from_secs(60),
            start,
            Duration::from_secs(15)
        ));
    }

    #[test]
    fn clock_going_backwards_is_not_idle() {
        let later = Instant::now();
        let earlier = later - Duration::from_secs(5);
        assert!(!idle_exceeded(earlier, later, Duration::from_secs(1)));
    }
}
