//! Reconnection backoff

use std::time::Duration;

use rand::Rng;

use crate::config::TransportConfig;

/// Exponential backoff with jitter, capped at a maximum delay
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.initial_delay(), config.max_delay())
    }

    /// Delay without jitter after the given (1-based) failed attempt
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Delay with up to a quarter of random jitter added, still capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = (base.as_millis() / 4) as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (base + jitter).min(self.max)
    }

    pub async fn sleep(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if delay.is_zero() {
            return;
        }

        tracing::trace!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");
        tokio::time::sleep(delay).await;
    }
}
