//! Timed and polled waits.
//!
//! Hardware needs time: pumps to reach steady flow, the coil to reach its
//! set point. [`pause`] covers fixed settling intervals; [`poll_until`]
//! re-checks a condition at an interval and reports whether it settled or
//! the bound expired.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

/// Result of a polled wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition held.
    Settled,
    /// The bound expired first.
    TimedOut,
}

impl WaitOutcome {
    /// Whether the condition held.
    pub fn is_settled(self) -> bool {
        matches!(self, WaitOutcome::Settled)
    }
}

/// Fixed settling delay. Zero returns immediately.
pub async fn pause(reason: &str, duration: Duration) {
    if duration.is_zero() {
        return;
    }
    debug!(reason, ?duration, "Settling");
    sleep(duration).await;
}

/// Check `condition` every `interval` until it returns true.
///
/// The condition is evaluated once before any sleep. With `max_wait` set, the
/// wait gives up once that much time has passed since the call; the final
/// check happens no later than the bound. `None`, or a bound too large to
/// represent as a deadline, waits forever.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    max_wait: Option<Duration>,
    mut condition: F,
) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = max_wait.and_then(|max| Instant::now().checked_add(max));
    loop {
        if condition().await {
            return WaitOutcome::Settled;
        }
        let now = Instant::now();
        match deadline {
            Some(deadline) if now >= deadline => return WaitOutcome::TimedOut,
            Some(deadline) => sleep(interval.min(deadline - now)).await,
            None => sleep(interval).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn settles_once_condition_holds() {
        let calls = AtomicUsize::new(0);
        let outcome = poll_until(Duration::from_millis(1), Some(Duration::from_secs(5)), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { n >= 3 }
        })
        .await;
        assert_eq!(outcome, WaitOutcome::Settled);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn immediate_success_does_not_sleep() {
        let started = std::time::Instant::now();
        let outcome = poll_until(Duration::from_secs(60), None, || async { true }).await;
        assert!(outcome.is_settled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn times_out_when_condition_never_holds() {
        let started = std::time::Instant::now();
        let outcome = poll_until(
            Duration::from_millis(5),
            Some(Duration::from_millis(40)),
            || async { false },
        )
        .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn unrepresentable_bound_waits_without_deadline() {
        let calls = AtomicUsize::new(0);
        let outcome = poll_until(Duration::from_millis(1), Some(Duration::MAX), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { n >= 2 }
        })
        .await;
        assert_eq!(outcome, WaitOutcome::Settled);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_pause_returns_immediately() {
        let started = std::time::Instant::now();
        pause("test", Duration::ZERO).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
