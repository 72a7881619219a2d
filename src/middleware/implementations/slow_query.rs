// Timing of everything downstream with a warning above a threshold
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::middleware::context::CallContext;
use crate::middleware::traits::Handler;

/// Scratch key holding the downstream duration in milliseconds (`u64`)
pub const ELAPSED_MS_KEY: &str = "elapsed_ms";

/// Warns about calls slower than `threshold`
#[derive(Debug, Clone)]
pub struct SlowQueryWarning {
    threshold: Duration,
}

impl SlowQueryWarning {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    pub fn from_millis(threshold_ms: u64) -> Self {
        Self::new(Duration::from_millis(threshold_ms))
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}

impl Default for SlowQueryWarning {
    fn default() -> Self {
        Self::from_millis(1000)
    }
}

#[async_trait]
impl Handler for SlowQueryWarning {
    fn name(&self) -> &'static str {
        "SlowQueryWarning"
    }

    async fn handle(&self, ctx: &mut CallContext) {
        let start = Instant::now();
        ctx.advance().await;
        let elapsed = start.elapsed();

        ctx.set(ELAPSED_MS_KEY, elapsed.as_millis() as u64);

        if elapsed > self.threshold {
            tracing::warn!(
                call = %ctx.id(),
                kind = %ctx.kind(),
                origin = %ctx.origin(),
                query = ctx.query(),
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.threshold.as_millis() as u64,
                "Slow database call"
            );
        }
    }
}
