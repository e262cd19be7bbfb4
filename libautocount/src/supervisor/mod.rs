//! Counting supervisor
//!
//! The supervisor is a single background task that owns all mutable counting
//! state: the counter, the identities, the governor and the persisted state.
//! Everything else talks to it through a cloneable [`SupervisorHandle`]:
//!
//! - a stop signal that wakes any pending sleep immediately,
//! - a status snapshot published over a `watch` channel,
//! - a command queue where every command carries a `oneshot` reply.
//!
//! Commands are consumed between state-machine steps, never in the middle of
//! a send.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use libautocount::client::mock::{MockChannel, MockClientFactory};
//! use libautocount::config::Config;
//! use libautocount::store::StateStore;
//! use libautocount::supervisor::SupervisorBuilder;
//!
//! # async fn example() -> libautocount::error::Result<()> {
//! let factory = Arc::new(MockClientFactory::new(MockChannel::new()));
//! let handle = SupervisorBuilder::new(Config::default(), StateStore::new("/tmp/state.json"), factory)
//!     .spawn()?;
//!
//! handle.set_channel("123456").await?;
//! handle.add_identity("alice", "token-a", None).await?;
//! handle.start(false).await?;
//! println!("{:?}", handle.status());
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::client::ClientFactory;
use crate::config::Config;
use crate::error::{AutocountError, Result};
use crate::reset::ResetDetector;
use crate::store::{RunHours, StateStore};
use crate::types::{ScanResult, StatusSnapshot};

pub mod events;
pub mod signal;
mod worker;

use events::{EventBus, EventReceiver};
use signal::StopSignal;
use worker::Worker;

const COMMAND_QUEUE: usize = 32;
const EVENT_CAPACITY: usize = 256;

/// Requests handled by the worker task
pub(crate) enum Command {
    Start {
        force: bool,
        limit: Option<u64>,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    ScanNow {
        reply: oneshot::Sender<Result<ScanResult>>,
    },
    FixMismatch {
        reply: oneshot::Sender<Result<ScanResult>>,
    },
    DeepRescan {
        reply: oneshot::Sender<Result<ScanResult>>,
    },
    ReconnectAll {
        reply: oneshot::Sender<Result<usize>>,
    },
    SetAutoRestart {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetChannel {
        channel_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    AddIdentity {
        label: String,
        token: String,
        user_agent: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveIdentity {
        label: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SetPacingBounds {
        min: Duration,
        max: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    SetCountLimit {
        limit: Option<u64>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetRunHours {
        hours: Option<RunHours>,
        reply: oneshot::Sender<Result<()>>,
    },
    AddParticipant {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveParticipant {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Assembles a supervisor from its collaborators
pub struct SupervisorBuilder {
    config: Config,
    store: StateStore,
    factory: Arc<dyn ClientFactory>,
    detector: Option<ResetDetector>,
}

impl SupervisorBuilder {
    pub fn new(config: Config, store: StateStore, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            config,
            store,
            factory,
            detector: None,
        }
    }

    /// Use a custom reset detector instead of the configured patterns
    pub fn detector(mut self, detector: ResetDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Load persisted state, build identities and start the worker task
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> Result<SupervisorHandle> {
        self.config.validate()?;
        let state = self.store.load_or_default(&self.config.runner)?;
        let span = tracing::info_span!(
            "supervisor",
            channel = state.channel_id.as_deref().unwrap_or("-"),
            identities = state.identities.len()
        );

        let detector = match self.detector {
            Some(detector) => detector,
            None => match &self.config.reset.patterns {
                Some(patterns) => {
                    ResetDetector::new(patterns, state.automated_participants.clone())?
                }
                None => ResetDetector::with_default_patterns(state.automated_participants.clone())?,
            },
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        let events = EventBus::new(EVENT_CAPACITY);
        let stop = StopSignal::new();

        let worker = Worker::new(
            self.config,
            Arc::new(self.store),
            self.factory,
            state,
            detector,
            command_rx,
            status_tx,
            events.clone(),
            stop.clone(),
        )?;
        tokio::spawn(worker.run().instrument(span));

        Ok(SupervisorHandle {
            commands: command_tx,
            status: status_rx,
            events,
            stop,
        })
    }
}

/// Control surface for a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StatusSnapshot>,
    events: EventBus,
    stop: StopSignal,
}

impl SupervisorHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| AutocountError::WorkerGone)?;
        response.await.map_err(|_| AutocountError::WorkerGone)
    }

    /// Begin counting; `force` skips the initial scan and ignores older resets
    ///
    /// # Errors
    ///
    /// `FatalConfiguration` when no channel or no identity is configured,
    /// `NoUsableIdentity` when every identity has been disabled.
    pub async fn start(&self, force: bool) -> Result<()> {
        self.start_with_limit(force, None).await
    }

    /// Like [`Self::start`], stopping after `limit` sends in this run only
    ///
    /// The limit is not persisted and takes precedence over the stored one.
    pub async fn start_with_limit(&self, force: bool, limit: Option<u64>) -> Result<()> {
        self.request(|reply| Command::Start {
            force,
            limit,
            reply,
        })
        .await?
    }

    /// Stop counting after the current step and persist the inactive flag
    pub async fn stop(&self) -> Result<()> {
        self.stop.trigger();
        self.request(|reply| Command::Stop { reply }).await
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Wait until the status satisfies `predicate`, or give up after `timeout`
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Option<StatusSnapshot>
    where
        F: FnMut(&StatusSnapshot) -> bool,
    {
        let mut status = self.status.clone();
        let wait = async move {
            loop {
                {
                    let current = status.borrow_and_update();
                    if predicate(&*current) {
                        return Some(current.clone());
                    }
                }
                if status.changed().await.is_err() {
                    let current = status.borrow();
                    return predicate(&*current).then(|| current.clone());
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Scan the channel without changing any state
    pub async fn scan_now(&self) -> Result<ScanResult> {
        self.request(|reply| Command::ScanNow { reply }).await?
    }

    /// One-off correction of the local count from the last few messages
    pub async fn fix_mismatch(&self) -> Result<ScanResult> {
        self.request(|reply| Command::FixMismatch { reply }).await?
    }

    /// Look further back for a reset signal, ignoring the recency window
    pub async fn deep_rescan(&self) -> Result<ScanResult> {
        self.request(|reply| Command::DeepRescan { reply }).await?
    }

    /// Recreate every identity's session; returns how many succeeded
    pub async fn reconnect_all(&self) -> Result<usize> {
        self.request(|reply| Command::ReconnectAll { reply }).await?
    }

    pub async fn set_auto_restart(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetAutoRestart { enabled, reply })
            .await?
    }

    pub async fn set_channel(&self, channel_id: impl Into<String>) -> Result<()> {
        let channel_id = channel_id.into();
        self.request(|reply| Command::SetChannel { channel_id, reply })
            .await?
    }

    pub async fn add_identity(
        &self,
        label: impl Into<String>,
        token: impl Into<String>,
        user_agent: Option<String>,
    ) -> Result<()> {
        let (label, token) = (label.into(), token.into());
        self.request(|reply| Command::AddIdentity {
            label,
            token,
            user_agent,
            reply,
        })
        .await?
    }

    pub async fn remove_identity(&self, label: impl Into<String>) -> Result<()> {
        let label = label.into();
        self.request(|reply| Command::RemoveIdentity { label, reply })
            .await?
    }

    pub async fn set_pacing_bounds(&self, min: Duration, max: Duration) -> Result<()> {
        self.request(|reply| Command::SetPacingBounds { min, max, reply })
            .await?
    }

    /// Stop after `limit` successful sends in every session; `None` removes it
    pub async fn set_count_limit(&self, limit: Option<u64>) -> Result<()> {
        self.request(|reply| Command::SetCountLimit { limit, reply })
            .await?
    }

    pub async fn set_run_hours(&self, hours: Option<RunHours>) -> Result<()> {
        self.request(|reply| Command::SetRunHours { hours, reply })
            .await?
    }

    /// Treat authors whose name contains `name` as automated
    pub async fn add_participant(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| Command::AddParticipant { name, reply })
            .await?
    }

    pub async fn remove_participant(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| Command::RemoveParticipant { name, reply })
            .await?
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Stop counting, persist, and end the worker task
    pub async fn shutdown(&self) -> Result<()> {
        self.stop.trigger();
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Combine a scan observation with an optional reset timestamp
pub(crate) fn scan_result(
    observation: &crate::scanner::Observation,
    reset_at: Option<DateTime<Utc>>,
) -> ScanResult {
    ScanResult {
        observed_count: observation.observed_count,
        last_author: observation.author_name.clone(),
        last_author_id: observation.author_id.clone(),
        reset_detected: reset_at.is_some(),
        reset_observed_at: reset_at,
        sample_size: observation.sample_size,
    }
}
