//! Identities the supervisor counts with

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::client::IdentityClient;
use crate::store::IdentityRecord;

/// Whether an identity may still be selected to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityStatus {
    Usable,
    Unusable(String),
}

/// One configured account with its own client session
pub struct Identity {
    pub label: String,
    credential: SecretString,
    pub user_agent: Option<String>,
    /// Service user id, known once authenticated
    pub user_id: Option<String>,
    pub message_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub status: IdentityStatus,
    client: Box<dyn IdentityClient>,
}

impl Identity {
    pub fn new(record: &IdentityRecord, client: Box<dyn IdentityClient>) -> Self {
        Self {
            label: record.label.clone(),
            credential: SecretString::from(record.token.clone()),
            user_agent: record.user_agent.clone(),
            user_id: None,
            message_count: record.message_count,
            last_used: None,
            status: IdentityStatus::Usable,
            client,
        }
    }

    pub fn client(&self) -> &dyn IdentityClient {
        self.client.as_ref()
    }

    pub fn is_usable(&self) -> bool {
        self.status == IdentityStatus::Usable
    }

    pub fn mark_unusable(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(identity = %self.label, %reason, "identity marked unusable");
        self.status = IdentityStatus::Unusable(reason);
    }

    pub fn record_send(&mut self, at: DateTime<Utc>) {
        self.message_count += 1;
        self.last_used = Some(at);
    }

    /// Whether a channel author is this identity
    ///
    /// Prefers the service user id; falls back to the label when the
    /// identity has not been authenticated.
    pub fn is_author(&self, author_id: Option<&str>, author_name: Option<&str>) -> bool {
        match (&self.user_id, author_id) {
            (Some(own), Some(author)) => own == author,
            _ => author_name.is_some_and(|name| name.eq_ignore_ascii_case(&self.label)),
        }
    }

    pub fn has_credential(&self, token: &str) -> bool {
        self.credential.expose_secret() == token
    }

    pub fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            label: self.label.clone(),
            token: self.credential.expose_secret().to_string(),
            user_agent: self.user_agent.clone(),
            message_count: self.message_count,
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("label", &self.label)
            .field("user_id", &self.user_id)
            .field("message_count", &self.message_count)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockChannel, MockClient};

    fn identity(label: &str) -> Identity {
        let record = IdentityRecord {
            label: label.to_string(),
            token: format!("token-{}", label),
            user_agent: None,
            message_count: 4,
        };
        Identity::new(&record, Box::new(MockClient::new(label, MockChannel::new())))
    }

    #[test]
    fn test_record_round_trip_keeps_count() {
        let mut alice = identity("alice");
        alice.record_send(Utc::now());
        let record = alice.to_record();
        assert_eq!(record.message_count, 5);
        assert_eq!(record.token, "token-alice");
        assert!(alice.last_used.is_some());
    }

    #[test]
    fn test_debug_hides_credential() {
        let alice = identity("alice");
        let debug = format!("{:?}", alice);
        assert!(!debug.contains("token-alice"));
        assert!(alice.has_credential("token-alice"));
    }

    #[test]
    fn test_author_matching() {
        let mut alice = identity("alice");
        assert!(alice.is_author(Some("whatever"), Some("Alice")));
        assert!(!alice.is_author(None, Some("bob")));

        alice.user_id = Some("42".to_string());
        assert!(alice.is_author(Some("42"), Some("renamed")));
        assert!(!alice.is_author(Some("43"), Some("alice")));
    }

    #[test]
    fn test_mark_unusable() {
        let mut alice = identity("alice");
        assert!(alice.is_usable());
        alice.mark_unusable("401 Unauthorized");
        assert_eq!(
            alice.status,
            IdentityStatus::Unusable("401 Unauthorized".to_string())
        );
        assert!(!alice.is_usable());
    }
}
