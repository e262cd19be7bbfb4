//! In-memory identity client for testing
//!
//! All mock clients built from one [`MockChannel`] share the same message
//! history, so values sent by one identity are visible to every other
//! identity's fetches. Failures can be scripted per identity to drive the
//! counting loop through rate limits, authorization failures and network
//! errors without touching the network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use super::{ClientFactory, IdentityClient, MAX_FETCH_LIMIT};
use crate::error::{ClientResult, IdentityError, Result};
use crate::store::IdentityRecord;
use crate::types::{AccountInfo, ChannelItem, SendReceipt};

#[derive(Debug, Default)]
struct ChannelInner {
    /// Newest first
    items: Vec<ChannelItem>,
    next_id: u64,
    scripted_sends: HashMap<String, VecDeque<IdentityError>>,
    failing_sends: HashMap<String, IdentityError>,
    failing_auth: HashMap<String, IdentityError>,
    /// Sends per label that report success but never appear in the channel
    lost_sends: HashMap<String, usize>,
    scripted_fetches: VecDeque<IdentityError>,
    attempts: Vec<(String, u64)>,
    sends: Vec<(String, u64)>,
    fetch_count: usize,
    presence_count: usize,
    reconnect_count: usize,
}

impl ChannelInner {
    fn push(&mut self, mut item: ChannelItem) {
        self.next_id += 1;
        if item.id.is_empty() {
            item.id = self.next_id.to_string();
        }
        self.items.push(item);
        // Stable sort keeps insertion order for equal timestamps, newest first
        self.items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }
}

/// Shared fake channel
#[derive(Debug, Clone, Default)]
pub struct MockChannel {
    inner: Arc<Mutex<ChannelInner>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a message from a human author, timestamped now
    pub fn post(&self, author: &str, content: &str) {
        self.post_at(author, content, Utc::now(), false);
    }

    /// Post a message with an explicit timestamp and automated flag
    pub fn post_at(&self, author: &str, content: &str, timestamp: DateTime<Utc>, automated: bool) {
        self.inner.lock().unwrap().push(ChannelItem {
            id: String::new(),
            content: content.to_string(),
            author_id: format!("user-{}", author),
            author_name: author.to_string(),
            author_is_automated: automated,
            timestamp,
        });
    }

    /// Queue one failure for the next send by `label`
    pub fn script_send_failure(&self, label: &str, error: IdentityError) {
        self.inner
            .lock()
            .unwrap()
            .scripted_sends
            .entry(label.to_string())
            .or_default()
            .push_back(error);
    }

    /// Make every send by `label` fail with `error`
    pub fn fail_all_sends(&self, label: &str, error: IdentityError) {
        self.inner
            .lock()
            .unwrap()
            .failing_sends
            .insert(label.to_string(), error);
    }

    /// The next send by `label` succeeds without the value reaching the channel
    pub fn lose_next_send(&self, label: &str) {
        *self
            .inner
            .lock()
            .unwrap()
            .lost_sends
            .entry(label.to_string())
            .or_default() += 1;
    }

    pub fn fail_auth(&self, label: &str, error: IdentityError) {
        self.inner
            .lock()
            .unwrap()
            .failing_auth
            .insert(label.to_string(), error);
    }

    /// Queue one failure for the next fetch by any identity
    pub fn script_fetch_failure(&self, error: IdentityError) {
        self.inner.lock().unwrap().scripted_fetches.push_back(error);
    }

    /// Successful sends as (label, value), oldest first
    pub fn sends(&self) -> Vec<(String, u64)> {
        self.inner.lock().unwrap().sends.clone()
    }

    /// Every send attempt, including failed ones
    pub fn attempts(&self) -> Vec<(String, u64)> {
        self.inner.lock().unwrap().attempts.clone()
    }

    pub fn sent_values(&self) -> Vec<u64> {
        self.sends().into_iter().map(|(_, value)| value).collect()
    }

    pub fn sent_by(&self) -> Vec<String> {
        self.sends().into_iter().map(|(label, _)| label).collect()
    }

    /// Channel history, newest first
    pub fn items(&self) -> Vec<ChannelItem> {
        self.inner.lock().unwrap().items.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.inner.lock().unwrap().fetch_count
    }

    pub fn presence_count(&self) -> usize {
        self.inner.lock().unwrap().presence_count
    }

    pub fn reconnect_count(&self) -> usize {
        self.inner.lock().unwrap().reconnect_count
    }
}

/// Mock identity client bound to a shared channel
pub struct MockClient {
    label: String,
    channel: MockChannel,
    delay: Duration,
}

impl MockClient {
    pub fn new(label: &str, channel: MockChannel) -> Self {
        Self {
            label: label.to_string(),
            channel,
            delay: Duration::ZERO,
        }
    }

    /// Simulated network latency on every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn user_id(&self) -> String {
        format!("mock-{}", self.label)
    }

    async fn latency(&self) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl IdentityClient for MockClient {
    fn label(&self) -> &str {
        &self.label
    }

    async fn authenticate(&self) -> ClientResult<AccountInfo> {
        self.latency().await;
        let inner = self.channel.inner.lock().unwrap();
        if let Some(error) = inner.failing_auth.get(&self.label) {
            return Err(error.clone());
        }
        Ok(AccountInfo {
            user_id: self.user_id(),
            username: self.label.clone(),
        })
    }

    async fn send_value(&self, _channel: &str, value: u64) -> ClientResult<SendReceipt> {
        self.latency().await;
        let mut inner = self.channel.inner.lock().unwrap();
        inner.attempts.push((self.label.clone(), value));

        if let Some(error) = inner.failing_sends.get(&self.label) {
            return Err(error.clone());
        }
        if let Some(error) = inner
            .scripted_sends
            .get_mut(&self.label)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }

        let sent_at = Utc::now();
        if let Some(lost) = inner.lost_sends.get_mut(&self.label).filter(|n| **n > 0) {
            *lost -= 1;
            inner.next_id += 1;
            return Ok(SendReceipt {
                message_id: inner.next_id.to_string(),
                sent_at,
            });
        }
        inner.push(ChannelItem {
            id: String::new(),
            content: value.to_string(),
            author_id: self.user_id(),
            author_name: self.label.clone(),
            author_is_automated: false,
            timestamp: sent_at,
        });
        inner.sends.push((self.label.clone(), value));
        Ok(SendReceipt {
            message_id: inner.next_id.to_string(),
            sent_at,
        })
    }

    async fn fetch_recent(&self, _channel: &str, limit: u8) -> ClientResult<Vec<ChannelItem>> {
        self.latency().await;
        let mut inner = self.channel.inner.lock().unwrap();
        inner.fetch_count += 1;
        if let Some(error) = inner.scripted_fetches.pop_front() {
            return Err(error);
        }
        let limit = limit.min(MAX_FETCH_LIMIT) as usize;
        Ok(inner.items.iter().take(limit).cloned().collect())
    }

    async fn indicate_presence(&self, _channel: &str) {
        self.channel.inner.lock().unwrap().presence_count += 1;
    }

    async fn reconnect(&self) -> ClientResult<()> {
        self.channel.inner.lock().unwrap().reconnect_count += 1;
        Ok(())
    }
}

/// Builds [`MockClient`]s that all share one channel
#[derive(Debug, Clone, Default)]
pub struct MockClientFactory {
    channel: MockChannel,
    delay: Duration,
}

impl MockClientFactory {
    pub fn new(channel: MockChannel) -> Self {
        Self {
            channel,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn channel(&self) -> &MockChannel {
        &self.channel
    }
}

impl ClientFactory for MockClientFactory {
    fn create(&self, record: &IdentityRecord) -> Result<Box<dyn IdentityClient>> {
        Ok(Box::new(
            MockClient::new(&record.label, self.channel.clone()).with_delay(self.delay),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sends_visible_to_other_identities() {
        let channel = MockChannel::new();
        let alice = MockClient::new("alice", channel.clone());
        let bob = MockClient::new("bob", channel.clone());

        alice.send_value("c", 1).await.unwrap();
        bob.send_value("c", 2).await.unwrap();

        let items = alice.fetch_recent("c", 10).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].content, "2");
        assert_eq!(items[0].author_id, "mock-bob");
        assert_eq!(channel.sent_by(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_scripted_failure_consumed_once() {
        let channel = MockChannel::new();
        let client = MockClient::new("alice", channel.clone());
        channel.script_send_failure(
            "alice",
            IdentityError::RateLimited {
                retry_after: Duration::from_millis(5),
                global: false,
            },
        );

        assert!(client.send_value("c", 1).await.unwrap_err().is_rate_limited());
        assert!(client.send_value("c", 1).await.is_ok());
        assert_eq!(channel.attempts().len(), 2);
        assert_eq!(channel.sent_values(), vec![1]);
    }

    #[tokio::test]
    async fn test_lost_send_reports_success_only() {
        let channel = MockChannel::new();
        let client = MockClient::new("alice", channel.clone());
        channel.lose_next_send("alice");

        assert!(client.send_value("c", 1).await.is_ok());
        assert!(channel.items().is_empty());
        assert!(channel.sends().is_empty());

        client.send_value("c", 1).await.unwrap();
        assert_eq!(channel.sent_values(), vec![1]);
    }

    #[tokio::test]
    async fn test_fetch_respects_limit() {
        let channel = MockChannel::new();
        for i in 0..5 {
            channel.post("alice", &i.to_string());
        }
        let client = MockClient::new("bob", channel.clone());
        assert_eq!(client.fetch_recent("c", 3).await.unwrap().len(), 3);
        assert_eq!(channel.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_older_posts_sorted_behind_newer() {
        let channel = MockChannel::new();
        channel.post("alice", "5");
        channel.post_at(
            "CountingBot",
            "old",
            Utc::now() - chrono::Duration::seconds(60),
            true,
        );
        let items = channel.items();
        assert_eq!(items[0].content, "5");
        assert_eq!(items[1].content, "old");
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let channel = MockChannel::new();
        channel.fail_auth("alice", IdentityError::Unauthorized("401".into()));
        let factory = MockClientFactory::new(channel);
        let record = IdentityRecord {
            label: "alice".to_string(),
            token: "t".to_string(),
            user_agent: None,
            message_count: 0,
        };
        let client = factory.create(&record).unwrap();
        assert!(client.authenticate().await.unwrap_err().is_authorization());
    }
}
