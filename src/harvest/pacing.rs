use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Upper bound for any retry backoff, server-requested delays included.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Random pause used to keep request patterns irregular.
///
/// Every call to [`Jitter::pause`] sleeps a uniformly random duration in
/// `[0, max)`. A zero bound disables pausing entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    max: Duration,
}

impl Jitter {
    pub fn new(max: Duration) -> Self {
        Self { max }
    }

    /// A jitter that never sleeps.
    #[cfg(test)]
    pub fn none() -> Self {
        Self::new(Duration::ZERO)
    }

    #[cfg(test)]
    pub fn from_secs(max_secs: u64) -> Self {
        Self::new(Duration::from_secs(max_secs))
    }

    /// Pick the next pause without sleeping.
    pub fn sample(&self) -> Duration {
        let max_ms = self.max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..max_ms))
    }

    /// Sleep for a random duration below the configured bound.
    pub async fn pause(&self) -> Duration {
        let delay = self.sample();
        if !delay.is_zero() {
            debug!("Pacing for {:?}", delay);
            tokio::time::sleep(delay).await;
        }
        delay
    }
}

/// Exponential backoff for retry `attempt` (1-based), capped at 60 seconds.
pub fn calculate_backoff(attempt: usize, base_delay: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as u32;
    let delay = base_delay.saturating_mul(1 << exponent);
    std::cmp::min(delay, MAX_BACKOFF)
}
