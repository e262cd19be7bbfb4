//! Core types for Autocount

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One message read back from a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelItem {
    pub id: String,
    pub content: String,
    pub author_id: String,
    pub author_name: String,
    /// Set by the service for bot/application authors
    pub author_is_automated: bool,
    pub timestamp: DateTime<Utc>,
}

/// Acknowledgement of a successful post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    pub sent_at: DateTime<Utc>,
}

/// Service account details learned while authenticating an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub user_id: String,
    pub username: String,
}

/// Snapshot of the channel produced by a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub observed_count: u64,
    pub last_author: Option<String>,
    pub last_author_id: Option<String>,
    pub reset_detected: bool,
    pub reset_observed_at: Option<DateTime<Utc>>,
    pub sample_size: usize,
}

/// Durable counting progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub current_count: u64,
    pub last_identity_index: Option<usize>,
    pub counting_active: bool,
    pub reset_pending: bool,
    /// Timestamp of the last reset signal that was acted upon
    #[serde(default)]
    pub last_reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateEventKind {
    Success,
    RateLimited,
    Error,
}

/// Outcome of one send attempt, fed to the speed governor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateEvent {
    pub kind: RateEventKind,
    pub retry_after: Option<Duration>,
    pub is_global: bool,
    pub observed_at: DateTime<Utc>,
}

impl RateEvent {
    pub fn success() -> Self {
        Self {
            kind: RateEventKind::Success,
            retry_after: None,
            is_global: false,
            observed_at: Utc::now(),
        }
    }

    pub fn rate_limited(retry_after: Duration, is_global: bool) -> Self {
        Self {
            kind: RateEventKind::RateLimited,
            retry_after: Some(retry_after),
            is_global,
            observed_at: Utc::now(),
        }
    }

    pub fn error() -> Self {
        Self {
            kind: RateEventKind::Error,
            retry_after: None,
            is_global: false,
            observed_at: Utc::now(),
        }
    }
}

/// Phase of the counting state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Scanning,
    Deciding,
    Sending,
    Cooldown,
    Stopped,
    Stalled,
}

impl Phase {
    /// Phases in which the background loop is actively cycling
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Phase::Scanning | Phase::Deciding | Phase::Sending | Phase::Cooldown
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Scanning => "scanning",
            Phase::Deciding => "deciding",
            Phase::Sending => "sending",
            Phase::Cooldown => "cooldown",
            Phase::Stopped => "stopped",
            Phase::Stalled => "stalled",
        };
        f.write_str(name)
    }
}

/// Read-only view of the supervisor handed to the control surface
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub current_count: u64,
    pub counting_active: bool,
    pub identity_count: usize,
    pub last_identity: Option<String>,
    pub unusable_identities: Vec<String>,
    pub current_delay: Duration,
    /// Rate limits among the governor's recent events
    pub recent_rate_limits: usize,
    pub counts_this_session: u64,
    pub last_error: Option<String>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            current_count: 0,
            counting_active: false,
            identity_count: 0,
            last_identity: None,
            unusable_identities: Vec::new(),
            current_delay: Duration::ZERO,
            recent_rate_limits: 0,
            counts_this_session: 0,
            last_error: None,
        }
    }
}
