//! Per-connection read pacing.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Token bucket: up to `burst` reads back to back, then one per `period`.
#[derive(Debug)]
pub struct ReadLimiter {
    period: Duration,
    burst: u32,
    tokens: u32,
    refilled_at: Instant,
}

impl ReadLimiter {
    pub fn new(period: Duration, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            period,
            burst,
            tokens: burst,
            refilled_at: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.period.is_zero() {
            self.tokens = self.burst;
            self.refilled_at = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.refilled_at);
        let earned = elapsed.as_nanos() / self.period.as_nanos();
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(earned).min(self.burst);
        if self.tokens == self.burst {
            self.refilled_at = now;
        } else {
            // Less than `burst`, so no overflow.
            self.refilled_at += self.period * earned;
        }
    }

    /// Takes one token, waiting for it when the bucket is empty.
    pub async fn acquire(&mut self) {
        loop {
            self.refill(Instant::now());
            if self.tokens > 0 {
                self.tokens -= 1;
                return;
            }
            sleep_until(self.refilled_at + self.period).await;
        }
    }

    pub fn available(&mut self) -> u32 {
        self.refill(Instant::now());
        self.tokens
    }
}
