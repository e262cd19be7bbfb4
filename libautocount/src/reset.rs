//! Reset detection
//!
//! Counting bots announce a broken streak with messages like
//! "RUINED IT AT 57!! Next number is **1**". The detector classifies recent
//! items against a list of declarative matchers and reports the most recent
//! actionable reset signal.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::ChannelItem;

/// Built-in reset phrases, evaluated case-insensitively
pub const DEFAULT_RESET_PATTERNS: &[&str] = &[
    r"next number is \**1\**(\D|$)",
    r"counting starts at \**1\**(\D|$)",
    r"count starts.*?at \**1\**(\D|$)",
    r"ruined it at",
    r"we reached \d+ before the streak ended",
    r"start again from 1(\D|$)",
    r"⚠️.*\b1\b",
    r"ruined.*\b(1|one)\b",
];

/// One reset-signal pattern
#[derive(Debug, Clone)]
pub struct ResetMatcher {
    pattern: Regex,
}

impl ResetMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { pattern: regex })
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// Time bounds for which reset signals are still actionable
#[derive(Debug, Clone, Copy)]
pub struct RecencyWindow {
    pub now: DateTime<Utc>,
    /// Maximum age of a signal; `None` accepts any age
    pub max_age: Option<Duration>,
    /// Signals at or before this instant were already acted upon
    pub not_before: Option<DateTime<Utc>>,
}

impl RecencyWindow {
    pub fn new(now: DateTime<Utc>, max_age: Duration) -> Self {
        Self {
            now,
            max_age: Some(max_age),
            not_before: None,
        }
    }

    pub fn unbounded(now: DateTime<Utc>) -> Self {
        Self {
            now,
            max_age: None,
            not_before: None,
        }
    }

    pub fn not_before(mut self, cutoff: Option<DateTime<Utc>>) -> Self {
        self.not_before = cutoff;
        self
    }

    fn admits(&self, timestamp: DateTime<Utc>) -> bool {
        if self.not_before.is_some_and(|cutoff| timestamp <= cutoff) {
            return false;
        }
        match self.max_age {
            Some(max_age) => {
                let age = self.now.signed_duration_since(timestamp);
                // Slightly future timestamps (clock skew) are treated as fresh
                age.to_std().map_or(true, |age| age <= max_age)
            }
            None => true,
        }
    }
}

/// A reset signal found in the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetSignal {
    pub item_id: String,
    pub observed_at: DateTime<Utc>,
    pub author_name: String,
    pub pattern: String,
}

#[derive(Debug, Clone)]
pub struct ResetDetector {
    matchers: Vec<ResetMatcher>,
    participants: Vec<String>,
}

impl ResetDetector {
    /// Build a detector from pattern strings and automated participant names
    pub fn new<S: AsRef<str>>(patterns: &[S], participants: Vec<String>) -> Result<Self> {
        let matchers = patterns
            .iter()
            .map(|p| ResetMatcher::new(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            matchers,
            participants: normalize(participants),
        })
    }

    pub fn with_default_patterns(participants: Vec<String>) -> Result<Self> {
        Self::new(DEFAULT_RESET_PATTERNS, participants)
    }

    pub fn set_participants(&mut self, participants: Vec<String>) {
        self.participants = normalize(participants);
    }

    fn is_participant(&self, item: &ChannelItem) -> bool {
        let author = item.author_name.to_lowercase();
        self.participants.iter().any(|p| author.contains(p.as_str()))
    }

    /// First actionable reset signal in batch order (most recent first)
    pub fn detect(&self, items: &[ChannelItem], window: RecencyWindow) -> Option<ResetSignal> {
        items
            .iter()
            .filter(|item| self.is_participant(item))
            .filter(|item| window.admits(item.timestamp))
            .find_map(|item| {
                self.matchers
                    .iter()
                    .find(|m| m.is_match(&item.content))
                    .map(|m| ResetSignal {
                        item_id: item.id.clone(),
                        observed_at: item.timestamp,
                        author_name: item.author_name.clone(),
                        pattern: m.as_str().to_string(),
                    })
            })
    }
}

fn normalize(participants: Vec<String>) -> Vec<String> {
    participants
        .into_iter()
        .map(|p| p.to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}
