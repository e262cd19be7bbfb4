//! Identity clients
//!
//! An identity client wraps one account's authenticated session with the
//! messaging service. Each client owns its own transport; sessions are never
//! shared across identities.
//!
//! # Examples
//!
//! ```no_run
//! use libautocount::client::{IdentityClient, mock::{MockChannel, MockClient}};
//!
//! # async fn example() -> libautocount::error::ClientResult<()> {
//! let channel = MockChannel::new();
//! let client = MockClient::new("alice", channel.clone());
//!
//! client.send_value("123", 1).await?;
//! let items = client.fetch_recent("123", 10).await?;
//! assert_eq!(items[0].content, "1");
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::{ClientResult, Result};
use crate::store::IdentityRecord;
use crate::types::{AccountInfo, ChannelItem, SendReceipt};

pub mod discord;

// Mock client is available for all builds (not just tests) to support integration tests
pub mod mock;

/// Upper bound the service accepts for a single history fetch
pub const MAX_FETCH_LIMIT: u8 = 100;

/// Contract every identity transport must satisfy
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Label of the identity this client acts for
    fn label(&self) -> &str;

    /// Resolve the service account behind the credential
    ///
    /// # Errors
    ///
    /// `IdentityError::Unauthorized` / `Forbidden` when the credential is
    /// rejected; the identity should then be treated as unusable.
    async fn authenticate(&self) -> ClientResult<AccountInfo>;

    /// Post `value` to `channel` as this identity
    ///
    /// Rate limits are returned as `IdentityError::RateLimited` without any
    /// internal retry. Connection-level failures are retried per the client's
    /// retry policy before being surfaced.
    async fn send_value(&self, channel: &str, value: u64) -> ClientResult<SendReceipt>;

    /// Most recent items in `channel`, newest first
    ///
    /// `limit` is clamped to [`MAX_FETCH_LIMIT`].
    async fn fetch_recent(&self, channel: &str, limit: u8) -> ClientResult<Vec<ChannelItem>>;

    /// Best-effort typing indicator; failures are logged, never returned
    ///
    /// Returns as soon as the indicator is posted. Holding it for a while is
    /// up to the caller.
    async fn indicate_presence(&self, channel: &str);

    /// Drop the current transport session and open a fresh one
    async fn reconnect(&self) -> ClientResult<()>;
}

/// Builds clients for persisted identities
///
/// Injected into the supervisor so tests can substitute in-memory clients.
pub trait ClientFactory: Send + Sync {
    fn create(&self, record: &IdentityRecord) -> Result<Box<dyn IdentityClient>>;
}

/// Retry policy for connection-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based): base doubling, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Run `call` until it succeeds, fails permanently, or attempts run out
///
/// Only transient errors (timeouts, connection failures) are retried; rate
/// limits and authorization failures are returned immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    label: &str,
    mut call: F,
) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(identity = label, operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    identity = label,
                    operation,
                    attempt,
                    max_attempts,
                    error = %e,
                    "transient failure, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::warn!(
                        identity = label,
                        operation,
                        error = %e,
                        "giving up after {} attempts",
                        max_attempts
                    );
                }
                return Err(e);
            }
        }
    }
}
