//! Jittered delay primitives.
//!
//! Every pause the engine takes between requests goes through here so that
//! concurrent tasks never settle into a synchronised request rhythm.

use rand::Rng;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

const MIN_DELAY: Duration = Duration::from_millis(10);
const POLL_VARIANCE_PCT: f64 = 0.10;

/// Returns `base` shifted by a uniform offset in `[-variance, +variance]`,
/// never shorter than 10ms.
pub fn jitter(base: Duration, variance: Duration) -> Duration {
    let base_ms = base.as_secs_f64() * 1000.0;
    let variance_ms = variance.as_secs_f64() * 1000.0;
    let offset = if variance_ms > 0.0 {
        rand::thread_rng().gen_range(-variance_ms..=variance_ms)
    } else {
        0.0
    };
    let delay = Duration::from_secs_f64(((base_ms + offset) / 1000.0).max(0.0));
    delay.max(MIN_DELAY)
}

pub async fn sleep_with_jitter(base: Duration, variance: Duration) {
    sleep(jitter(base, variance)).await;
}

/// Delay between two stock polls: the configured base with ±10% jitter.
pub fn poll_interval(base: Duration) -> Duration {
    jitter(base, base.mul_f64(POLL_VARIANCE_PCT))
}

/// Kinds of pause a person takes between actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HumanAction {
    Click,
    Type,
    Read,
    Navigate,
    Checkout,
    Default,
}

impl HumanAction {
    /// Range in milliseconds the pause is drawn from.
    pub fn range_ms(self) -> (u64, u64) {
        match self {
            HumanAction::Click => (100, 300),
            HumanAction::Type => (50, 150),
            HumanAction::Read => (500, 1500),
            HumanAction::Navigate => (300, 800),
            HumanAction::Checkout => (200, 500),
            HumanAction::Default => (100, 400),
        }
    }

    pub fn delay(self) -> Duration {
        let (min, max) = self.range_ms();
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

pub async fn human_delay(action: HumanAction) {
    sleep(action.delay()).await;
}

/// Enforces a minimum spacing between acquisitions.
///
/// Shared behind an `Arc` by every request handle of a run when a global
/// request rate is configured.
/// Slowest pace a [`RateLimiter`] will enforce.
pub const MAX_RATE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        let min_interval = if requests_per_second > 0.0 {
            Duration::try_from_secs_f64(1.0 / requests_per_second)
                .map_or(MAX_RATE_INTERVAL, |interval| interval.min(MAX_RATE_INTERVAL))
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until another request may be sent.
    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(300);
        let variance = Duration::from_millis(30);
        for _ in 0..500 {
            let delay = jitter(base, variance);
            assert!(delay >= Duration::from_millis(270));
            assert!(delay <= Duration::from_millis(330));
        }
    }

    #[test]
    fn jitter_never_drops_below_floor() {
        for _ in 0..100 {
            let delay = jitter(Duration::from_millis(5), Duration::from_millis(50));
            assert!(delay >= MIN_DELAY);
        }
    }

    #[test]
    fn poll_interval_uses_ten_percent_variance() {
        let base = Duration::from_secs(1);
        for _ in 0..200 {
            let delay = poll_interval(base);
            assert!(delay >= Duration::from_millis(900));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn human_delay_respects_action_range() {
        for _ in 0..100 {
            let delay = HumanAction::Checkout.delay();
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_acquisitions() {
        let limiter = RateLimiter::new(4.0);
        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[test]
    fn rate_limiter_clamps_extreme_rates() {
        assert_eq!(RateLimiter::new(1e-300).min_interval(), MAX_RATE_INTERVAL);
        assert_eq!(RateLimiter::new(0.0).min_interval(), Duration::ZERO);
        assert_eq!(RateLimiter::new(f64::NAN).min_interval(), Duration::ZERO);
        assert_eq!(RateLimiter::new(2.0).min_interval(), Duration::from_millis(500));
    }
}
