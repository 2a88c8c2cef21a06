//! Sliding-window rate limiting.
//!
//! Three windows guard the query endpoint: a global 1-second window, a
//! global 60-second window, and a per-user 60-second window. Each window is
//! a deque of timestamps; old entries are stripped on every check.
//! `check_and_record` performs both steps under one lock so concurrent
//! callers cannot overshoot a window.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: usize,
    pub retry_after_secs: Option<f64>,
    pub message: String,
}

struct LimiterState {
    global_requests: VecDeque<Instant>,
    user_requests: HashMap<String, VecDeque<Instant>>,
    total_requests: u64,
    rejected_requests: u64,
}

pub struct RateLimiter {
    state: Mutex<LimiterState>,
    requests_per_second: usize,
    requests_per_minute: usize,
    user_requests_per_minute: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStatistics {
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub rejection_rate: f64,
    pub current_global_requests: usize,
    pub active_users: usize,
}

impl RateLimiter {
    pub fn new(
        requests_per_second: usize,
        requests_per_minute: usize,
        user_requests_per_minute: usize,
    ) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                global_requests: VecDeque::new(),
                user_requests: HashMap::new(),
                total_requests: 0,
                rejected_requests: 0,
            }),
            requests_per_second,
            requests_per_minute,
            user_requests_per_minute,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn strip_old(requests: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while let Some(front) = requests.front() {
            if now.duration_since(*front) > window {
                requests.pop_front();
            } else {
                break;
            }
        }
    }

    /// (allowed, remaining, retry_after) against one window.
    fn check_window(
        requests: &mut VecDeque<Instant>,
        limit: usize,
        window: Duration,
        now: Instant,
    ) -> (bool, usize, f64) {
        Self::strip_old(requests, window, now);
        let count = requests.len();
        let remaining = limit.saturating_sub(count);

        if count >= limit {
            let retry_after = requests
                .front()
                .map(|oldest| {
                    let reset = *oldest + window;
                    reset.saturating_duration_since(now).as_secs_f64()
                })
                .unwrap_or_else(|| window.as_secs_f64());
            return (false, remaining, retry_after);
        }
        (true, remaining, 0.0)
    }

    fn check_inner(&self, state: &mut LimiterState, user_id: Option<&str>) -> RateLimitResult {
        let now = Instant::now();

        let (allowed, remaining, retry_after) = Self::check_window(
            &mut state.global_requests,
            self.requests_per_second,
            Duration::from_secs(1),
            now,
        );
        if !allowed {
            state.rejected_requests += 1;
            return RateLimitResult {
                allowed: false,
                remaining,
                retry_after_secs: Some(retry_after),
                message: "Global rate limit exceeded (per second)".to_string(),
            };
        }

        let (allowed, remaining, retry_after) = Self::check_window(
            &mut state.global_requests,
            self.requests_per_minute,
            Duration::from_secs(60),
            now,
        );
        if !allowed {
            state.rejected_requests += 1;
            return RateLimitResult {
                allowed: false,
                remaining,
                retry_after_secs: Some(retry_after),
                message: "Global rate limit exceeded (per minute)".to_string(),
            };
        }

        let mut last_remaining = remaining;
        if let Some(user_id) = user_id {
            let user_requests = state.user_requests.entry(user_id.to_string()).or_default();
            let (allowed, remaining, retry_after) = Self::check_window(
                user_requests,
                self.user_requests_per_minute,
                Duration::from_secs(60),
                now,
            );
            if !allowed {
                state.rejected_requests += 1;
                return RateLimitResult {
                    allowed: false,
                    remaining,
                    retry_after_secs: Some(retry_after),
                    message: format!("User rate limit exceeded for {}", user_id),
                };
            }
            last_remaining = remaining;
        }

        RateLimitResult {
            allowed: true,
            remaining: last_remaining,
            retry_after_secs: None,
            message: "Request allowed".to_string(),
        }
    }

    fn record_inner(state: &mut LimiterState, user_id: Option<&str>) {
        let now = Instant::now();
        state.global_requests.push_back(now);
        state.total_requests += 1;
        if let Some(user_id) = user_id {
            state
                .user_requests
                .entry(user_id.to_string())
                .or_default()
                .push_back(now);
        }
    }

    pub fn check(&self, user_id: Option<&str>) -> RateLimitResult {
        let mut state = self.lock_state();
        self.check_inner(&mut state, user_id)
    }

    pub fn record(&self, user_id: Option<&str>) {
        let mut state = self.lock_state();
        Self::record_inner(&mut state, user_id);
    }

    /// Check and, on success, record — atomically under the limiter lock.
    pub fn check_and_record(&self, user_id: Option<&str>) -> RateLimitResult {
        let mut state = self.lock_state();
        let result = self.check_inner(&mut state, user_id);
        if result.allowed {
            Self::record_inner(&mut state, user_id);
        }
        result
    }

    pub fn get_statistics(&self) -> RateLimiterStatistics {
        let state = self.lock_state();
        RateLimiterStatistics {
            total_requests: state.total_requests,
            rejected_requests: state.rejected_requests,
            rejection_rate: if state.total_requests > 0 {
                state.rejected_requests as f64 / state.total_requests as f64
            } else {
                0.0
            },
            current_global_requests: state.global_requests.len(),
            active_users: state.user_requests.len(),
        }
    }

    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.global_requests.clear();
        state.user_requests.clear();
        state.total_requests = 0;
        state.rejected_requests = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_second_limit() {
        let limiter = RateLimiter::new(3, 100, 100);

        for _ in 0..3 {
            assert!(limiter.check_and_record(None).allowed);
        }
        let rejected = limiter.check_and_record(None);
        assert!(!rejected.allowed);
        assert!(rejected.retry_after_secs.is_some());
        assert!(rejected.message.contains("per second"));
    }

    #[test]
    fn test_per_minute_limit() {
        let limiter = RateLimiter::new(100, 5, 100);
        for _ in 0..5 {
            assert!(limiter.check_and_record(None).allowed);
        }
        let rejected = limiter.check_and_record(None);
        assert!(!rejected.allowed);
        assert!(rejected.message.contains("per minute"));
    }

    #[test]
    fn test_per_user_limit_is_independent() {
        let limiter = RateLimiter::new(100, 100, 2);

        assert!(limiter.check_and_record(Some("alice")).allowed);
        assert!(limiter.check_and_record(Some("alice")).allowed);
        let rejected = limiter.check_and_record(Some("alice"));
        assert!(!rejected.allowed);
        assert!(rejected.message.contains("alice"));

        // A different user still gets through
        assert!(limiter.check_and_record(Some("bob")).allowed);
    }

    #[test]
    fn test_check_without_record_has_no_side_effect() {
        let limiter = RateLimiter::new(1, 100, 100);
        assert!(limiter.check(None).allowed);
        assert!(limiter.check(None).allowed);
        assert_eq!(limiter.get_statistics().total_requests, 0);
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(2, 100, 100);
        assert!(limiter.check_and_record(None).allowed);
        assert!(limiter.check_and_record(None).allowed);
        assert!(!limiter.check_and_record(None).allowed);

        std::thread::sleep(Duration::from_millis(1100));
        assert!(limiter.check_and_record(None).allowed);
    }

    #[test]
    fn test_statistics() {
        let limiter = RateLimiter::new(1, 100, 100);
        limiter.check_and_record(Some("alice"));
        limiter.check_and_record(Some("alice"));

        let stats = limiter.get_statistics();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.rejected_requests, 1);
        assert_eq!(stats.active_users, 1);
    }
}
