//! Stop requests for the counting loop
//!
//! Every run gets its own `CancellationToken`. The handle cancels whichever
//! token is current; the worker issues a fresh one when a run starts or
//! after a stop has been handled, so a stale cancellation never leaks into
//! the next run or into an idle-time command.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared slot holding the token of the current run
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    current: Arc<Mutex<CancellationToken>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the current run's token
    pub fn trigger(&self) {
        self.token().cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the current token with a fresh one and return it
    pub fn rearm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        token
    }
}

/// Sleep for `duration` unless `token` is cancelled first
///
/// Returns `true` if the full duration elapsed.
pub async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_pause_completes_without_stop() {
        let signal = StopSignal::new();
        assert!(pause(&signal.token(), Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_trigger_wakes_pause_immediately() {
        let signal = StopSignal::new();
        let token = signal.token();
        let started = Instant::now();
        let sleeper = tokio::spawn(async move { pause(&token, Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.trigger();

        assert!(!sleeper.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_rearm_issues_uncancelled_token() {
        let signal = StopSignal::new();
        let old = signal.token();
        signal.trigger();
        assert!(old.is_cancelled());
        assert!(!pause(&old, Duration::from_secs(30)).await);

        let fresh = signal.rearm();
        assert!(!fresh.is_cancelled());
        assert!(!signal.token().is_cancelled());
        assert!(pause(&fresh, Duration::from_millis(1)).await);

        // Cancelling through the signal reaches the new token only
        signal.trigger();
        assert!(fresh.is_cancelled());
    }
}
