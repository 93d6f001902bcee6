//! Time source used by the supervisor, engine and monitor.
//!
//! Production code runs on [`TokioClock`]. Tests can swap in
//! [`crate::mock::ManualClock`] to observe requested delays without
//! waiting for them.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Clock backed by tokio's timer, so paused test time applies to it too.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
