//! HTTP identity client for a Discord-style REST API

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::RwLock;
use std::time::Duration;

use super::{with_retry, ClientFactory, IdentityClient, RetryPolicy, MAX_FETCH_LIMIT};
use crate::config::ApiConfig;
use crate::error::{ClientResult, IdentityError, Result};
use crate::store::IdentityRecord;
use crate::types::{AccountInfo, ChannelItem, SendReceipt};

pub struct DiscordClient {
    label: String,
    token: SecretString,
    user_agent: String,
    base_url: String,
    timeout: Duration,
    retry: RetryPolicy,
    http: RwLock<reqwest::Client>,
}

impl DiscordClient {
    pub fn new(
        label: impl Into<String>,
        token: SecretString,
        user_agent: Option<String>,
        api: &ApiConfig,
    ) -> ClientResult<Self> {
        let user_agent = user_agent.unwrap_or_else(|| api.user_agent.clone());
        let timeout = api.request_timeout();
        let http = build_http(timeout, &user_agent)?;
        Ok(Self {
            label: label.into(),
            token,
            user_agent,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            timeout,
            retry: api.retry_policy(),
            http: RwLock::new(http),
        })
    }

    fn http(&self) -> reqwest::Client {
        self.http
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_account(&self) -> ClientResult<AccountInfo> {
        let response = self
            .http()
            .get(self.url("/users/@me"))
            .header("Authorization", self.token.expose_secret())
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let user: ApiUser = response
            .json()
            .await
            .map_err(|e| IdentityError::Malformed(format!("account info: {}", e)))?;
        Ok(AccountInfo {
            user_id: user.id,
            username: user.username.unwrap_or_default(),
        })
    }

    async fn post_message(&self, channel: &str, value: u64) -> ClientResult<SendReceipt> {
        let payload = serde_json::json!({
            "content": value.to_string(),
            "tts": false,
        });
        let response = self
            .http()
            .post(self.url(&format!("/channels/{}/messages", channel)))
            .header("Authorization", self.token.expose_secret())
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        // The post already landed; an unreadable body must not trigger a resend
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message_id = body
            .get("id")
            .and_then(|id| id.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(SendReceipt {
            message_id,
            sent_at: Utc::now(),
        })
    }

    async fn get_messages(&self, channel: &str, limit: u8) -> ClientResult<Vec<ChannelItem>> {
        let response = self
            .http()
            .get(self.url(&format!("/channels/{}/messages", channel)))
            .header("Authorization", self.token.expose_secret())
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| IdentityError::Malformed(format!("message list: {}", e)))?;
        parse_messages(body)
    }
}

#[async_trait]
impl IdentityClient for DiscordClient {
    fn label(&self) -> &str {
        &self.label
    }

    async fn authenticate(&self) -> ClientResult<AccountInfo> {
        let account = with_retry(&self.retry, "authenticate", &self.label, || {
            self.get_account()
        })
        .await?;
        tracing::info!(identity = %self.label, user_id = %account.user_id, "authenticated");
        Ok(account)
    }

    async fn send_value(&self, channel: &str, value: u64) -> ClientResult<SendReceipt> {
        with_retry(&self.retry, "send", &self.label, || {
            self.post_message(channel, value)
        })
        .await
    }

    async fn fetch_recent(&self, channel: &str, limit: u8) -> ClientResult<Vec<ChannelItem>> {
        let limit = limit.clamp(1, MAX_FETCH_LIMIT);
        with_retry(&self.retry, "fetch", &self.label, || {
            self.get_messages(channel, limit)
        })
        .await
    }

    async fn indicate_presence(&self, channel: &str) {
        let result = self
            .http()
            .post(self.url(&format!("/channels/{}/typing", channel)))
            .header("Authorization", self.token.expose_secret())
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(identity = %self.label, "typing");
            }
            Ok(response) => {
                tracing::debug!(
                    identity = %self.label,
                    status = response.status().as_u16(),
                    "typing indicator rejected"
                );
            }
            Err(e) => {
                tracing::debug!(identity = %self.label, error = %e, "typing indicator failed");
            }
        }
    }

    async fn reconnect(&self) -> ClientResult<()> {
        let fresh = build_http(self.timeout, &self.user_agent)?;
        *self.http.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        tracing::info!(identity = %self.label, "session recreated");
        Ok(())
    }
}

/// Creates [`DiscordClient`]s from persisted identities
#[derive(Debug, Clone)]
pub struct DiscordClientFactory {
    api: ApiConfig,
}

impl DiscordClientFactory {
    pub fn new(api: ApiConfig) -> Self {
        Self { api }
    }
}

impl ClientFactory for DiscordClientFactory {
    fn create(&self, record: &IdentityRecord) -> Result<Box<dyn IdentityClient>> {
        let client = DiscordClient::new(
            record.label.clone(),
            SecretString::from(record.token.clone()),
            record.user_agent.clone(),
            &self.api,
        )?;
        Ok(Box::new(client))
    }
}

fn build_http(timeout: Duration, user_agent: &str) -> ClientResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(user_agent)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| IdentityError::Other(format!("failed to build HTTP client: {}", e)))
}

fn transport_error(e: reqwest::Error) -> IdentityError {
    if e.is_timeout() {
        IdentityError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        IdentityError::Connection(e.to_string())
    } else {
        IdentityError::Other(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> ClientResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    #[serde(default = "default_retry_after")]
    retry_after: f64,
    #[serde(default)]
    global: bool,
}

/// Longest server-requested wait honored before retrying
const MAX_RETRY_AFTER_SECS: f64 = 3600.0;

fn default_retry_after() -> f64 {
    1.0
}

/// Map a non-success status and its body to a failure class
pub(crate) fn classify_status(status: StatusCode, body: &str) -> IdentityError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let limit = serde_json::from_str::<RateLimitBody>(body).unwrap_or(RateLimitBody {
                retry_after: default_retry_after(),
                global: false,
            });
            let seconds = if limit.retry_after.is_finite() {
                limit.retry_after.clamp(0.0, MAX_RETRY_AFTER_SECS)
            } else {
                default_retry_after()
            };
            IdentityError::RateLimited {
                retry_after: Duration::from_secs_f64(seconds),
                global: limit.global,
            }
        }
        StatusCode::UNAUTHORIZED => IdentityError::Unauthorized(summarize(status, body)),
        StatusCode::FORBIDDEN => IdentityError::Forbidden(summarize(status, body)),
        StatusCode::NOT_FOUND => IdentityError::NotFound(summarize(status, body)),
        _ => IdentityError::Other(summarize(status, body)),
    }
}

fn summarize(status: StatusCode, body: &str) -> String {
    let body: String = body.chars().take(200).collect();
    format!("HTTP {} - {}", status.as_u16(), body)
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    id: String,
    #[serde(default)]
    content: String,
    author: ApiUser,
    timestamp: DateTime<Utc>,
}

/// Parse a message list, skipping items that do not have the expected shape
pub(crate) fn parse_messages(body: serde_json::Value) -> ClientResult<Vec<ChannelItem>> {
    let serde_json::Value::Array(raw) = body else {
        return Err(IdentityError::Malformed(
            "expected a list of messages".to_string(),
        ));
    };

    let total = raw.len();
    let items: Vec<ChannelItem> = raw
        .into_iter()
        .filter_map(|value| serde_json::from_value::<ApiMessage>(value).ok())
        .map(|m| ChannelItem {
            id: m.id,
            content: m.content,
            author_id: m.author.id,
            author_name: m.author.username.unwrap_or_default(),
            author_is_automated: m.author.bot,
            timestamp: m.timestamp,
        })
        .collect();

    if items.len() < total {
        tracing::debug!(skipped = total - items.len(), "skipped malformed messages");
    }
    if total > 0 && items.is_empty() {
        return Err(IdentityError::Malformed(
            "no message in the response could be parsed".to_string(),
        ));
    }
    Ok(items)
}
