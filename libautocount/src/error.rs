//! Error types for Autocount

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AutocountError>;

/// Result type returned by identity client operations
pub type ClientResult<T> = std::result::Result<T, IdentityError>;

#[derive(Error, Debug)]
pub enum AutocountError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cannot start counting: {0}")]
    FatalConfiguration(String),

    #[error("No usable identity remains")]
    NoUsableIdentity,

    #[error("Counting supervisor is no longer running")]
    WorkerGone,

    #[error("Interrupted by a stop request")]
    Interrupted,
}

impl AutocountError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            AutocountError::InvalidInput(_) => 3,
            AutocountError::Identity(e) if e.is_authorization() => 2,
            AutocountError::NoUsableIdentity => 2,
            AutocountError::Identity(_) => 1,
            AutocountError::Config(_) => 1,
            AutocountError::Store(_) => 1,
            AutocountError::FatalConfiguration(_) => 1,
            AutocountError::WorkerGone => 1,
            AutocountError::Interrupted => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid reset pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access state file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse state file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Failures surfaced by an identity client
///
/// Mirrors the outcome classes of the messaging service: transport failures,
/// authorization failures, rate limiting and everything else.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited (retry after {retry_after:?}, global: {global})")]
    RateLimited { retry_after: Duration, global: bool },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Request failed: {0}")]
    Other(String),
}

impl IdentityError {
    /// Connection-level failures that are worth retrying on a fresh attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, IdentityError::Timeout(_) | IdentityError::Connection(_))
    }

    /// Failures that make the identity unusable until reconfigured
    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            IdentityError::Unauthorized(_) | IdentityError::Forbidden(_)
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, IdentityError::RateLimited { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = AutocountError::InvalidInput("Empty label".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_authorization_errors() {
        let unauthorized = AutocountError::Identity(IdentityError::Unauthorized("bad token".into()));
        let forbidden = AutocountError::Identity(IdentityError::Forbidden("no access".into()));
        assert_eq!(unauthorized.exit_code(), 2);
        assert_eq!(forbidden.exit_code(), 2);
        assert_eq!(AutocountError::NoUsableIdentity.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_other_errors() {
        let network = AutocountError::Identity(IdentityError::Connection("refused".into()));
        assert_eq!(network.exit_code(), 1);

        let config = AutocountError::Config(ConfigError::MissingField("channel_id".into()));
        assert_eq!(config.exit_code(), 1);

        let fatal = AutocountError::FatalConfiguration("no channel set".into());
        assert_eq!(fatal.exit_code(), 1);
    }

    #[test]
    fn test_transient_classification() {
        assert!(IdentityError::Timeout("send".into()).is_transient());
        assert!(IdentityError::Connection("send".into()).is_transient());

        let limited = IdentityError::RateLimited {
            retry_after: Duration::from_secs(1),
            global: false,
        };
        assert!(!limited.is_transient());
        assert!(limited.is_rate_limited());
        assert!(!IdentityError::Unauthorized("x".into()).is_transient());
        assert!(!IdentityError::Other("x".into()).is_transient());
    }

    #[test]
    fn test_authorization_classification() {
        assert!(IdentityError::Unauthorized("x".into()).is_authorization());
        assert!(IdentityError::Forbidden("x".into()).is_authorization());
        assert!(!IdentityError::NotFound("x".into()).is_authorization());
        assert!(!IdentityError::Timeout("x".into()).is_authorization());
    }

    #[test]
    fn test_error_message_formatting() {
        let error = AutocountError::Identity(IdentityError::Unauthorized(
            "alice: 401 invalid token".to_string(),
        ));
        assert_eq!(
            format!("{}", error),
            "Identity error: Unauthorized: alice: 401 invalid token"
        );

        let fatal = AutocountError::FatalConfiguration("no channel set".to_string());
        assert_eq!(format!("{}", fatal), "Cannot start counting: no channel set");
    }

    #[test]
    fn test_rate_limit_formatting_includes_wait() {
        let error = IdentityError::RateLimited {
            retry_after: Duration::from_millis(1500),
            global: true,
        };
        let message = format!("{}", error);
        assert!(message.contains("1.5s"));
        assert!(message.contains("global: true"));
    }

    #[test]
    fn test_error_conversion_from_identity_error() {
        let converted: AutocountError = IdentityError::Other("boom".into()).into();
        match converted {
            AutocountError::Identity(IdentityError::Other(msg)) => assert_eq!(msg, "boom"),
            other => panic!("Expected AutocountError::Identity, got {:?}", other),
        }
    }

    #[test]
    fn test_identity_error_clone() {
        // Retry loops hand the last error back after cloning it
        let original = IdentityError::Connection("reset by peer".to_string());
        let cloned = original.clone();
        assert_eq!(original, cloned);
    }
}
