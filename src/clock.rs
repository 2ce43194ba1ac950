//! Monotonic time source. Every other component depends on `Arc<dyn Clock>`
//! rather than calling `tokio::time` or `std::time` directly, so tests can
//! run against Tokio's paused-time runtime and get deterministic, fast
//! invariant checks instead of wall-clock-flaky ones.

use std::time::Duration;

use async_trait::async_trait;

/// A monotonic instant, opaque outside this module except for arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(tokio::time::Instant);

impl Instant {
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    pub fn checked_sub(&self, duration: Duration) -> Option<Instant> {
        self.0.checked_sub(duration).map(Instant)
    }

    pub fn elapsed_since(&self, now: Instant) -> Duration {
        now.duration_since(*self)
    }
}

#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Production clock. A thin wrapper so the rest of the engine never imports
/// `tokio::time` directly — in tests the same type runs under a paused
/// runtime (`#[tokio::test(start_paused = true)]` + `tokio::time::advance`),
/// giving deterministic timing without a parallel virtual-clock type.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant(tokio::time::Instant::now())
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_advances_with_paused_time() {
        let clock = SystemClock;
        let start = clock.now();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.now().duration_since(start), Duration::from_secs(5));
    }
}
