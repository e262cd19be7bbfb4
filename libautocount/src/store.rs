//! Durable counting state
//!
//! The state file is JSON and is always rewritten whole. Writes go to a
//! sibling temp file which is then renamed over the original, so a crash
//! mid-write leaves the previous state intact. A mutex serializes the
//! read-modify-write cycle within the process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::RunnerConfig;
use crate::error::{AutocountError, Result, StoreError};
use crate::governor::MAX_PACING_DELAY;
use crate::types::CounterState;

/// One configured identity as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub label: String,
    pub token: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub message_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingBounds {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Local hours during which the loop may send, `[start_hour, end_hour)`
///
/// A window whose end is before its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHours {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl RunHours {
    pub fn new(start_hour: u8, end_hour: u8) -> Result<Self> {
        if start_hour > 23 || end_hour > 23 {
            return Err(AutocountError::InvalidInput(format!(
                "run hours must be between 0 and 23 (got {}-{})",
                start_hour, end_hour
            )));
        }
        Ok(Self {
            start_hour,
            end_hour,
        })
    }

    pub fn contains(&self, hour: u8) -> bool {
        if self.start_hour == self.end_hour {
            true
        } else if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub counter: CounterState,
    pub pacing: PacingBounds,
    pub recency_window_secs: u64,
    #[serde(default)]
    pub automated_participants: Vec<String>,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub count_limit: Option<u64>,
    #[serde(default)]
    pub run_hours: Option<RunHours>,
    #[serde(default)]
    pub identities: Vec<IdentityRecord>,
}

impl PersistedState {
    /// Fresh state seeded from runner defaults
    pub fn from_runner(runner: &RunnerConfig) -> Self {
        Self {
            channel_id: None,
            counter: CounterState::default(),
            pacing: PacingBounds {
                min_delay_ms: runner.min_delay_ms,
                max_delay_ms: runner.max_delay_ms,
            },
            recency_window_secs: runner.recency_window_secs,
            automated_participants: runner.automated_participants.clone(),
            auto_restart: false,
            count_limit: None,
            run_hours: None,
            identities: Vec::new(),
        }
    }

    /// Copy safe to share: channel, labels, tokens and user agents replaced
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.channel_id.is_some() {
            copy.channel_id = Some("CHANNEL_ID".to_string());
        }
        for (i, identity) in copy.identities.iter_mut().enumerate() {
            identity.label = format!("account-{}", i + 1);
            identity.token = "TOKEN".to_string();
            if identity.user_agent.is_some() {
                identity.user_agent = Some("USER_AGENT".to_string());
            }
        }
        copy
    }

    /// Append an identity, rejecting empty fields and duplicate labels or tokens
    pub fn add_identity(&mut self, record: IdentityRecord) -> Result<()> {
        if record.label.trim().is_empty() || record.token.trim().is_empty() {
            return Err(AutocountError::InvalidInput(
                "identity label and token are required".to_string(),
            ));
        }
        if self.identities.iter().any(|i| i.label == record.label) {
            return Err(AutocountError::InvalidInput(format!(
                "an identity labelled '{}' already exists",
                record.label
            )));
        }
        if self.identities.iter().any(|i| i.token == record.token) {
            return Err(AutocountError::InvalidInput(
                "this token is already configured for another identity".to_string(),
            ));
        }
        self.identities.push(record);
        Ok(())
    }

    /// Remove an identity by label, keeping the last-sender index pointing
    /// at the same identity
    pub fn remove_identity(&mut self, label: &str) -> Result<IdentityRecord> {
        let index = self
            .identities
            .iter()
            .position(|i| i.label == label)
            .ok_or_else(|| {
                AutocountError::InvalidInput(format!("no identity labelled '{}'", label))
            })?;
        let removed = self.identities.remove(index);
        self.counter.last_identity_index = match self.counter.last_identity_index {
            Some(last) if last == index => None,
            Some(last) if last > index => Some(last - 1),
            other => other,
        };
        Ok(removed)
    }

    pub fn set_pacing(&mut self, min_delay_ms: u64, max_delay_ms: u64) -> Result<()> {
        if min_delay_ms > max_delay_ms {
            return Err(AutocountError::InvalidInput(format!(
                "minimum delay {}ms exceeds maximum {}ms",
                min_delay_ms, max_delay_ms
            )));
        }
        let cap = MAX_PACING_DELAY.as_millis() as u64;
        if max_delay_ms > cap {
            return Err(AutocountError::InvalidInput(format!(
                "maximum delay {}ms exceeds the {}ms limit",
                max_delay_ms, cap
            )));
        }
        self.pacing = PacingBounds {
            min_delay_ms,
            max_delay_ms,
        };
        Ok(())
    }

    /// Add an automated participant name; matching is case-insensitive
    pub fn add_participant(&mut self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AutocountError::InvalidInput(
                "participant name cannot be empty".to_string(),
            ));
        }
        if self
            .automated_participants
            .iter()
            .any(|p| p.eq_ignore_ascii_case(name))
        {
            return Err(AutocountError::InvalidInput(format!(
                "participant '{}' is already listed",
                name
            )));
        }
        self.automated_participants.push(name.to_string());
        Ok(())
    }

    /// Remove a participant name, returning it as it was stored
    pub fn remove_participant(&mut self, name: &str) -> Result<String> {
        let name = name.trim();
        let index = self
            .automated_participants
            .iter()
            .position(|p| p.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                AutocountError::InvalidInput(format!("participant '{}' is not listed", name))
            })?;
        Ok(self.automated_participants.remove(index))
    }
}

impl Default for PersistedState {
    fn default() -> Self {
        Self::from_runner(&RunnerConfig::default())
    }
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state file; `None` when it does not exist yet
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_unlocked()
    }

    /// Read the state file, falling back to fresh runner defaults
    pub fn load_or_default(&self, runner: &RunnerConfig) -> Result<PersistedState> {
        Ok(self
            .load()?
            .unwrap_or_else(|| PersistedState::from_runner(runner)))
    }

    /// Atomically replace the state file
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_unlocked(state)
    }

    /// Read-modify-write under the store lock
    pub fn update<F>(&self, runner: &RunnerConfig, mutate: F) -> Result<PersistedState>
    where
        F: FnOnce(&mut PersistedState) -> Result<()>,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self
            .read_unlocked()?
            .unwrap_or_else(|| PersistedState::from_runner(runner));
        mutate(&mut state)?;
        self.write_unlocked(&state)?;
        Ok(state)
    }

    fn read_unlocked(&self) -> Result<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        let state = serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(Some(state))
    }

    fn write_unlocked(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let json = serde_json::to_string_pretty(state).map_err(StoreError::Serialize)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".to_string());
        let temp_path = self
            .path
            .with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        std::fs::write(&temp_path, json).map_err(|e| self.io_error(e))?;

        // Tokens live in this file
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(&temp_path, permissions) {
                let _ = std::fs::remove_file(&temp_path);
                return Err(self.io_error(e));
            }
        }

        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(self.io_error(e));
        }

        tracing::trace!(path = %self.path.display(), "state persisted");
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> AutocountError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state() -> PersistedState {
        let mut state = PersistedState::default();
        state.channel_id = Some("1234567890".to_string());
        state.counter.current_count = 9;
        state.counter.last_identity_index = Some(0);
        state.identities.push(IdentityRecord {
            label: "alice".to_string(),
            token: "secret-token-a".to_string(),
            user_agent: Some("Custom/1.0".to_string()),
            message_count: 3,
        });
        state
    }

    #[test]
    fn test_missing_file_loads_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));
        assert!(store.load().unwrap().is_none());

        let state = store.load_or_default(&RunnerConfig::default()).unwrap();
        assert_eq!(state.counter, CounterState::default());
        assert_eq!(state.pacing.min_delay_ms, 1000);
        assert_eq!(state.recency_window_secs, 300);
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path().join("nested/dir/state.json"));
        let state = sample_state();

        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));
        store.save(&sample_state()).unwrap();
        store.save(&sample_state()).unwrap();

        let entries: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], "state.json");
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = StateStore::new(&path).load().unwrap_err();
        assert!(err.to_string().contains("Failed to parse state file"));
    }

    #[test]
    fn test_minimal_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"pacing": {"min_delay_ms": 5, "max_delay_ms": 10}, "recency_window_secs": 60}"#,
        )
        .unwrap();

        let state = StateStore::new(&path).load().unwrap().unwrap();
        assert!(state.channel_id.is_none());
        assert!(state.identities.is_empty());
        assert!(!state.counter.counting_active);
        assert!(state.counter.last_reset_at.is_none());
    }

    #[test]
    fn test_update_is_read_modify_write() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));
        store.save(&sample_state()).unwrap();

        let updated = store
            .update(&RunnerConfig::default(), |state| {
                state.auto_restart = true;
                Ok(())
            })
            .unwrap();
        assert!(updated.auto_restart);

        let reloaded = store.load().unwrap().unwrap();
        assert!(reloaded.auto_restart);
        assert_eq!(reloaded.counter.current_count, 9);
    }

    #[test]
    fn test_failed_update_leaves_file_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));
        store.save(&sample_state()).unwrap();

        let result = store.update(&RunnerConfig::default(), |state| {
            state.counter.current_count = 1000;
            Err(AutocountError::InvalidInput("nope".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.load().unwrap().unwrap().counter.current_count, 9);
    }

    #[cfg(unix)]
    #[test]
    fn test_state_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        StateStore::new(&path).save(&sample_state()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let redacted = sample_state().redacted();
        assert_eq!(redacted.channel_id.as_deref(), Some("CHANNEL_ID"));
        assert_eq!(redacted.identities[0].label, "account-1");
        assert_eq!(redacted.identities[0].token, "TOKEN");
        assert_eq!(redacted.identities[0].user_agent.as_deref(), Some("USER_AGENT"));
        assert_eq!(redacted.counter.current_count, 9);

        let json = serde_json::to_string(&redacted).unwrap();
        assert!(!json.contains("secret-token-a"));
        assert!(!json.contains("1234567890"));
    }

    #[test]
    fn test_run_hours() {
        let day = RunHours::new(9, 17).unwrap();
        assert!(day.contains(9));
        assert!(day.contains(16));
        assert!(!day.contains(17));
        assert!(!day.contains(3));

        let night = RunHours::new(22, 6).unwrap();
        assert!(night.contains(23));
        assert!(night.contains(0));
        assert!(!night.contains(6));
        assert!(!night.contains(12));

        assert!(RunHours::new(0, 0).unwrap().contains(13));
        assert!(RunHours::new(24, 3).is_err());
    }

    fn record(label: &str, token: &str) -> IdentityRecord {
        IdentityRecord {
            label: label.to_string(),
            token: token.to_string(),
            user_agent: None,
            message_count: 0,
        }
    }

    #[test]
    fn test_add_identity_rejects_duplicates() {
        let mut state = sample_state();
        state.add_identity(record("bob", "secret-token-b")).unwrap();
        assert_eq!(state.identities.len(), 2);

        assert!(state.add_identity(record("bob", "other")).is_err());
        assert!(state.add_identity(record("carol", "secret-token-a")).is_err());
        assert!(state.add_identity(record(" ", "tok")).is_err());
        assert_eq!(state.identities.len(), 2);
    }

    #[test]
    fn test_remove_identity_shifts_last_sender() {
        let mut state = sample_state();
        state.add_identity(record("bob", "b")).unwrap();
        state.add_identity(record("carol", "c")).unwrap();
        state.counter.last_identity_index = Some(2);

        state.remove_identity("alice").unwrap();
        assert_eq!(state.counter.last_identity_index, Some(1));
        assert_eq!(state.identities[1].label, "carol");

        state.remove_identity("carol").unwrap();
        assert_eq!(state.counter.last_identity_index, None);

        assert!(state.remove_identity("nobody").is_err());
    }

    #[test]
    fn test_set_pacing_validates_order() {
        let mut state = sample_state();
        state.set_pacing(200, 900).unwrap();
        assert_eq!(state.pacing.min_delay_ms, 200);
        assert!(state.set_pacing(900, 200).is_err());
        assert!(state.set_pacing(0, 3_600_001).is_err());
        assert_eq!(state.pacing.max_delay_ms, 900);
    }

    #[test]
    fn test_participants_are_case_insensitive() {
        let mut state = sample_state();
        let before = state.automated_participants.len();

        state.add_participant("  Helper ").unwrap();
        assert_eq!(state.automated_participants.last().unwrap(), "Helper");
        assert!(state.add_participant("HELPER").is_err());
        assert!(state.add_participant("   ").is_err());

        assert_eq!(state.remove_participant("helper").unwrap(), "Helper");
        assert_eq!(state.automated_participants.len(), before);
        assert!(state.remove_participant("helper").is_err());
    }
}
