use std::{collections::VecDeque, time::Duration};

use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};

const ONE_MINUTE: Duration = Duration::from_millis(60 * 1000);

/// Keeps requests under a rolling one-minute limit.
///
/// The first `rate_limit - min_rate` requests of a window go out immediately. After that every
/// request is spaced so that the remaining `min_rate` requests are spread over a full minute, and
/// once the window is full callers wait for the oldest request to age out.
pub struct RateLimiter {
    // Sorted from oldest to newest
    sent: Mutex<VecDeque<Instant>>,
    rate_limit: usize,
    unthrottled_budget: usize,
    spacing: Duration,
}

impl RateLimiter {
    pub fn new(rate_limit: usize, min_rate: usize) -> Self {
        let rate_limit = rate_limit.max(1);
        let min_rate = min_rate.clamp(1, rate_limit);
        let spacing = Duration::from_millis((60_000 / min_rate + 1) as u64);

        Self {
            sent: Mutex::new(VecDeque::with_capacity(rate_limit)),
            rate_limit,
            unthrottled_budget: rate_limit - min_rate,
            spacing,
        }
    }

    pub async fn throttle_request(&self) {
        let mut sent = self.sent.lock().await;

        while let Some(&oldest) = sent.front() {
            if oldest.elapsed() < ONE_MINUTE {
                break;
            }
            sent.pop_front();
        }

        if sent.len() >= self.rate_limit {
            if let Some(oldest) = sent.pop_front() {
                let elapsed = oldest.elapsed();
                if elapsed < ONE_MINUTE {
                    sleep(ONE_MINUTE - elapsed).await;
                }
            }
        } else if sent.len() >= self.unthrottled_budget {
            sleep(self.spacing).await;
        }

        sent.push_back(Instant::now());
    }

    pub async fn in_window(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn budget_is_spent_before_spacing() {
        let limiter = RateLimiter::new(4, 2);
        let start = Instant::now();

        limiter.throttle_request().await;
        limiter.throttle_request().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.throttle_request().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(limiter.in_window().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn old_requests_leave_the_window() {
        let limiter = RateLimiter::new(200, 50);
        limiter.throttle_request().await;

        tokio::time::advance(ONE_MINUTE).await;
        limiter.throttle_request().await;
        assert_eq!(limiter.in_window().await, 1);
    }
}
