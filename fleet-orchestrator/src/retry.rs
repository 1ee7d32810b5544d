use std::future::Future;
use std::time::Duration;

use fleet_common::ProviderError;

/// Bounded exponential backoff: `initial * 2^attempt`, capped at `max_delay`,
/// giving up after `max_attempts` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max_delay: max_delay.max(initial),
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 30)
    }
}

/// Retry a provider call while it fails transiently.
pub async fn with_provider_retry<T, F, Fut>(
    backoff: &Backoff,
    op: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < backoff.max_attempts => {
                let delay = backoff.delay(attempt);
                tracing::warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "provider call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn doubles_until_capped() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_millis(700), 5);
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(3), Duration::from_millis(700));
        assert_eq!(b.delay(40), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn retries_transient_only() {
        let b = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 3);

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res = with_provider_retry(&b, "describe", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::Transient("throttled".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: Result<(), _> = with_provider_retry(&b, "launch", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Rejected("quota".into()))
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_ceiling() {
        let b = Backoff::new(Duration::from_millis(1), Duration::from_millis(1), 2);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: Result<(), _> = with_provider_retry(&b, "stop", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Transient("timeout".into()))
        })
        .await;
        assert!(res.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
