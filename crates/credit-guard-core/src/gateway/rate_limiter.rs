use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::debug;

pub const DEFAULT_MAX_REQUESTS: u32 = 60;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Per-caller sliding-window admission control.
///
/// Each caller keeps a time-ordered queue of admission instants; entries older
/// than the window are dropped on every call. Rejection never blocks.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn admit(&self, caller_id: &str) -> bool {
        self.admit_at(caller_id, Instant::now())
    }

    /// Same as [`admit`](Self::admit) with an explicit clock reading.
    pub fn admit_at(&self, caller_id: &str, now: Instant) -> bool {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Idle callers drop out of the map once their window drains.
        windows.retain(|_, entries| {
            self.evict(entries, now);
            !entries.is_empty()
        });
        if self.max_requests == 0 {
            debug!(caller_id, "rate limit reached");
            return false;
        }
        let entries = windows.entry(caller_id.to_string()).or_default();

        if entries.len() >= self.max_requests as usize {
            debug!(caller_id, in_window = entries.len(), "rate limit reached");
            return false;
        }
        // Keep the queue ordered even if a caller hands us a stale instant.
        let stamp = entries.back().map_or(now, |last| now.max(*last));
        entries.push_back(stamp);
        true
    }

    /// Admissions currently counted against `caller_id`.
    pub fn in_window(&self, caller_id: &str) -> usize {
        self.in_window_at(caller_id, Instant::now())
    }

    pub fn in_window_at(&self, caller_id: &str, now: Instant) -> usize {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(entries) = windows.get_mut(caller_id) else {
            return 0;
        };
        self.evict(entries, now);
        let count = entries.len();
        if count == 0 {
            windows.remove(caller_id);
        }
        count
    }

    /// Callers with at least one admission still inside the window.
    pub fn tracked_callers(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn evict(&self, entries: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = entries.front() {
            if now.saturating_duration_since(*front) >= self.window {
                entries.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_sixty_first_call_within_window() {
        let limiter = RateLimiter::default();
        let start = Instant::now();
        for i in 0..60 {
            assert!(
                limiter.admit_at("svc", start + Duration::from_millis(i * 100)),
                "call {} should be admitted",
                i + 1
            );
        }
        assert!(!limiter.admit_at("svc", start + Duration::from_secs(10)));
    }

    #[test]
    fn admits_again_after_window_rolls_over() {
        let limiter = RateLimiter::default();
        let start = Instant::now();
        for _ in 0..60 {
            assert!(limiter.admit_at("svc", start));
        }
        assert!(!limiter.admit_at("svc", start + Duration::from_secs(59)));
        assert!(limiter.admit_at("svc", start + Duration::from_secs(60)));
    }

    #[test]
    fn callers_are_isolated() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.admit_at("a", now));
        assert!(!limiter.admit_at("a", now));
        assert!(limiter.admit_at("b", now));
        assert_eq!(limiter.in_window_at("a", now), 1);
        assert_eq!(limiter.in_window_at("unknown", now), 0);
    }

    #[test]
    fn rejected_calls_do_not_consume_capacity() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();
        assert!(limiter.admit_at("svc", start));
        assert!(limiter.admit_at("svc", start + Duration::from_millis(500)));
        assert!(!limiter.admit_at("svc", start + Duration::from_millis(900)));
        assert!(limiter.admit_at("svc", start + Duration::from_millis(1000)));
        assert_eq!(
            limiter.in_window_at("svc", start + Duration::from_millis(1000)),
            2
        );
    }

    #[test]
    fn idle_callers_are_forgotten() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        let start = Instant::now();
        for i in 0..100 {
            assert!(limiter.admit_at(&format!("caller-{i}"), start));
        }
        assert_eq!(limiter.tracked_callers(), 100);

        let later = start + Duration::from_secs(2);
        assert!(limiter.admit_at("caller-0", later));
        assert_eq!(limiter.tracked_callers(), 1);
        assert_eq!(limiter.in_window_at("caller-0", later + Duration::from_secs(1)), 0);
        assert_eq!(limiter.tracked_callers(), 0);
    }

    #[test]
    fn zero_ceiling_rejects_without_tracking() {
        let limiter = RateLimiter::new(0, Duration::from_secs(60));
        assert!(!limiter.admit("svc"));
        assert_eq!(limiter.tracked_callers(), 0);
    }

    proptest! {
        #[test]
        fn never_admits_more_than_ceiling_per_window(
            ceiling in 1u32..20,
            offsets in proptest::collection::vec(0u64..5_000, 1..200),
        ) {
            let limiter = RateLimiter::new(ceiling, Duration::from_secs(1));
            let start = Instant::now();
            let mut sorted = offsets;
            sorted.sort_unstable();

            let mut admitted = Vec::new();
            for offset in sorted {
                let now = start + Duration::from_millis(offset);
                if limiter.admit_at("svc", now) {
                    admitted.push(offset);
                }
            }
            for (i, &at) in admitted.iter().enumerate() {
                let in_window = admitted[..=i].iter().filter(|&&t| at - t < 1_000).count();
                prop_assert!(in_window <= ceiling as usize);
            }
        }
    }
}
