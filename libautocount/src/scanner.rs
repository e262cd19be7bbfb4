//! Activity scanner
//!
//! Reads a batch of channel items and works out the highest count posted by a
//! human participant. Reset detection is handled separately by
//! [`crate::reset::ResetDetector`].

use chrono::{DateTime, Utc};

use crate::types::ChannelItem;

/// Highest count found in a batch, with its author
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Observation {
    pub observed_count: u64,
    pub author_name: Option<String>,
    pub author_id: Option<String>,
    pub sample_size: usize,
}

#[derive(Debug, Clone)]
pub struct ActivityScanner {
    participants: Vec<String>,
}

impl ActivityScanner {
    /// `participants` are the names of automated counting participants whose
    /// messages never count as values
    pub fn new(participants: Vec<String>) -> Self {
        Self {
            participants: participants
                .into_iter()
                .map(|p| p.to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn set_participants(&mut self, participants: Vec<String>) {
        *self = Self::new(participants);
    }

    /// Whether an item was written by an automated participant
    pub fn is_automated(&self, item: &ChannelItem) -> bool {
        if item.author_is_automated {
            return true;
        }
        let author = item.author_name.to_lowercase();
        self.participants.iter().any(|p| author.contains(p.as_str()))
    }

    /// Find the maximum plain-integer value in `items`
    ///
    /// Items at or before `since` are skipped. Ties keep the first (most recent)
    /// author in batch order.
    pub fn scan(&self, items: &[ChannelItem], since: Option<DateTime<Utc>>) -> Observation {
        let mut best: Option<(u64, &ChannelItem)> = None;

        for item in items {
            if since.is_some_and(|cutoff| item.timestamp <= cutoff) {
                continue;
            }
            if self.is_automated(item) {
                continue;
            }
            let Some(value) = parse_count(&item.content) else {
                continue;
            };
            if best.map_or(true, |(current, _)| value > current) {
                best = Some((value, item));
            }
        }

        match best {
            Some((value, item)) => Observation {
                observed_count: value,
                author_name: Some(item.author_name.clone()),
                author_id: Some(item.author_id.clone()),
                sample_size: items.len(),
            },
            None => Observation {
                sample_size: items.len(),
                ..Observation::default()
            },
        }
    }
}

/// Parse message text as a plain unsigned integer (ASCII digits only)
pub fn parse_count(content: &str) -> Option<u64> {
    let trimmed = content.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn item(content: &str, author: &str, age_secs: i64) -> ChannelItem {
        ChannelItem {
            id: format!("{}-{}", author, content),
            content: content.to_string(),
            author_id: format!("id-{}", author),
            author_name: author.to_string(),
            author_is_automated: false,
            timestamp: Utc::now() - ChronoDuration::seconds(age_secs),
        }
    }

    fn scanner() -> ActivityScanner {
        ActivityScanner::new(vec!["CountingBot".to_string()])
    }

    #[test]
    fn test_participant_values_excluded() {
        let items = vec![
            item("41", "alice", 3),
            item("abc", "bob", 2),
            item("43", "CountingBot", 1),
        ];
        let observation = scanner().scan(&items, None);
        assert_eq!(observation.observed_count, 41);
        assert_eq!(observation.author_name.as_deref(), Some("alice"));
        assert_eq!(observation.sample_size, 3);
    }

    #[test]
    fn test_scan_is_deterministic() {
        let items = vec![item("7", "alice", 2), item("8", "bob", 1)];
        let s = scanner();
        assert_eq!(s.scan(&items, None), s.scan(&items, None));
    }

    #[test]
    fn test_service_automated_flag_excluded() {
        let mut bot = item("99", "helper", 1);
        bot.author_is_automated = true;
        let items = vec![bot, item("12", "alice", 2)];
        assert_eq!(scanner().scan(&items, None).observed_count, 12);
    }

    #[test]
    fn test_participant_match_is_case_insensitive_substring() {
        let items = vec![item("50", "APP countingbot v2", 1), item("10", "alice", 2)];
        assert_eq!(scanner().scan(&items, None).observed_count, 10);
    }

    #[test]
    fn test_no_parseable_items() {
        let items = vec![item("hello", "alice", 1), item("-3", "bob", 2), item("4.5", "carol", 3)];
        let observation = scanner().scan(&items, None);
        assert_eq!(observation.observed_count, 0);
        assert!(observation.author_name.is_none());
        assert_eq!(observation.sample_size, 3);
    }

    #[test]
    fn test_maximum_wins_over_recency() {
        let items = vec![item("5", "alice", 1), item("9", "bob", 5), item("7", "carol", 3)];
        let observation = scanner().scan(&items, None);
        assert_eq!(observation.observed_count, 9);
        assert_eq!(observation.author_id.as_deref(), Some("id-bob"));
    }

    #[test]
    fn test_items_before_cutoff_ignored() {
        let items = vec![item("1", "alice", 1), item("120", "bob", 60)];
        let cutoff = Utc::now() - ChronoDuration::seconds(30);
        assert_eq!(scanner().scan(&items, Some(cutoff)).observed_count, 1);
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count(" 42 \n"), Some(42));
        assert_eq!(parse_count("0"), Some(0));
        assert_eq!(parse_count("+4"), None);
        assert_eq!(parse_count("4 2"), None);
        assert_eq!(parse_count(""), None);
        assert_eq!(parse_count("٣"), None);
        assert_eq!(parse_count("99999999999999999999999"), None);
    }
}
