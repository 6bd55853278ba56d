//! Fixed-rate pacing for batch loops
//!
//! Stripe tolerates roughly 4 requests per second on list-heavy batch work.
//! Every batch job sleeps through a `Pacer` between remote calls; this is a
//! fixed rate ceiling, not backoff.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    delay: Duration,
}

impl Pacer {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
        }
    }

    /// Wait out the inter-call delay.
    pub async fn wait(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    /// A pacer that never sleeps, for tests.
    pub fn unpaced() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }
}
