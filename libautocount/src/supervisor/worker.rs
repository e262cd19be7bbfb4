//! The counting state machine
//!
//! One `Worker` runs per supervisor inside its own tokio task. It is the only
//! writer of the counter and the persisted state.

use chrono::{Local, Timelike, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::events::{EventBus, SupervisorEvent};
use super::signal::{self, StopSignal};
use super::{scan_result, Command};
use crate::client::ClientFactory;
use crate::config::Config;
use crate::error::{AutocountError, ClientResult, IdentityError, Result};
use crate::governor::{SpeedGovernor, Verdict};
use crate::identity::Identity;
use crate::reset::{RecencyWindow, ResetDetector, ResetSignal};
use crate::rotator::IdentityRotator;
use crate::scanner::{ActivityScanner, Observation};
use crate::store::{IdentityRecord, PacingBounds, PersistedState, StateStore};
use crate::types::{AccountInfo, ChannelItem, Phase, RateEvent, ScanResult, StatusSnapshot};

/// Pause between run-hour checks while outside the window
const RUN_HOURS_POLL: Duration = Duration::from_secs(60);

enum FetchError {
    NoUsableIdentity,
    Stopped,
    Failed {
        identity: String,
        error: IdentityError,
    },
}

impl From<FetchError> for AutocountError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::NoUsableIdentity => AutocountError::NoUsableIdentity,
            FetchError::Stopped => AutocountError::Interrupted,
            FetchError::Failed { error, .. } => AutocountError::Identity(error),
        }
    }
}

pub(crate) struct Worker {
    config: Config,
    store: Arc<StateStore>,
    factory: Arc<dyn ClientFactory>,
    state: PersistedState,
    identities: Vec<Identity>,
    scanner: ActivityScanner,
    detector: ResetDetector,
    governor: SpeedGovernor,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<StatusSnapshot>,
    events: EventBus,
    stop: StopSignal,
    token: CancellationToken,
    rng: StdRng,

    phase: Phase,
    running: bool,
    pending_sender: Option<usize>,
    pending_reset: Option<ResetSignal>,
    rate_limit_retries: u32,
    sends_since_scan: u32,
    counts_this_session: u64,
    /// Limit given at start, ahead of the persisted one
    session_limit: Option<u64>,
    last_network_ok: Instant,
    last_error: Option<String>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Config,
        store: Arc<StateStore>,
        factory: Arc<dyn ClientFactory>,
        state: PersistedState,
        detector: ResetDetector,
        commands: mpsc::Receiver<Command>,
        status: watch::Sender<StatusSnapshot>,
        events: EventBus,
        stop: StopSignal,
    ) -> Result<Self> {
        let identities = state
            .identities
            .iter()
            .map(|record| -> Result<Identity> {
                Ok(Identity::new(record, factory.create(record)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let governor = SpeedGovernor::new(
            Duration::from_millis(state.pacing.min_delay_ms),
            Duration::from_millis(state.pacing.max_delay_ms),
            config.governor.clone(),
        )?;
        let scanner = ActivityScanner::new(state.automated_participants.clone());

        Ok(Self {
            config,
            store,
            factory,
            state,
            identities,
            scanner,
            detector,
            governor,
            commands,
            status,
            events,
            token: stop.token(),
            stop,
            rng: StdRng::from_entropy(),
            phase: Phase::Idle,
            running: false,
            pending_sender: None,
            pending_reset: None,
            rate_limit_retries: 0,
            sends_since_scan: 0,
            counts_this_session: 0,
            session_limit: None,
            last_network_ok: Instant::now(),
            last_error: None,
        })
    }

    pub(crate) async fn run(mut self) {
        self.authenticate_all().await;

        // A previous process may have died mid-run
        if self.state.counter.counting_active {
            self.state.counter.counting_active = false;
            self.persist();
        }
        self.publish_status();

        loop {
            if !self.running {
                let Some(command) = self.commands.recv().await else {
                    break;
                };
                if self.handle(command).await.is_break() {
                    return;
                }
                continue;
            }

            loop {
                match self.commands.try_recv() {
                    Ok(command) => {
                        if self.handle(command).await.is_break() {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.finish_stop(Phase::Stopped);
                        return;
                    }
                }
            }

            if !self.running {
                continue;
            }
            if self.token.is_cancelled() {
                self.finish_stop(Phase::Stopped);
                continue;
            }

            self.check_watchdog().await;
            let span = tracing::debug_span!("step", phase = %self.phase);
            self.step().instrument(span).await;
        }

        if self.running {
            self.finish_stop(Phase::Stopped);
        }
        tracing::debug!("supervisor worker exited");
    }

    async fn step(&mut self) {
        match self.phase {
            Phase::Scanning => self.scanning().await,
            Phase::Deciding => self.deciding().await,
            Phase::Sending => self.sending().await,
            Phase::Cooldown => self.cooldown().await,
            Phase::Idle | Phase::Stopped | Phase::Stalled => {
                self.running = false;
            }
        }
    }

    // ---- state machine ----

    async fn scanning(&mut self) {
        let items = match self.fetch_paced(self.config.scan.fetch_limit).await {
            Ok(items) => items,
            Err(FetchError::NoUsableIdentity) => return self.stall(),
            Err(FetchError::Stopped) => return,
            Err(FetchError::Failed { identity, error }) => {
                return self.cycle_failed("fetch", Some(identity), error).await;
            }
        };

        let window = self.recency_window();
        if let Some(signal) = self.detector.detect(&items, window) {
            self.pending_reset = Some(signal);
            self.set_phase(Phase::Cooldown);
            return;
        }

        let observation = self.scanner.scan(&items, self.state.counter.last_reset_at);
        self.reconcile(&observation);
        self.set_phase(Phase::Deciding);
    }

    async fn deciding(&mut self) {
        if let Some(limit) = self.session_limit.or(self.state.count_limit) {
            if self.counts_this_session >= limit {
                tracing::info!(limit, "count limit reached, stopping");
                self.events
                    .emit(SupervisorEvent::CountLimitReached { limit });
                self.finish_stop(Phase::Stopped);
                return;
            }
        } else if let Some(hours) = self.state.run_hours {
            let hour = Local::now().hour() as u8;
            if !hours.contains(hour) {
                tracing::info!(
                    hour,
                    start = hours.start_hour,
                    end = hours.end_hour,
                    "outside run hours, waiting"
                );
                if self.pause(RUN_HOURS_POLL).await {
                    self.set_phase(Phase::Scanning);
                }
                return;
            }
        }

        let usable: Vec<bool> = self.identities.iter().map(Identity::is_usable).collect();
        match IdentityRotator::next(&usable, self.state.counter.last_identity_index) {
            Some(index) => {
                self.pending_sender = Some(index);
                self.rate_limit_retries = 0;
                self.set_phase(Phase::Sending);
            }
            None => self.stall(),
        }
    }

    async fn sending(&mut self) {
        let Some(index) = self.pending_sender.filter(|&i| i < self.identities.len()) else {
            self.pending_sender = None;
            self.set_phase(Phase::Deciding);
            return;
        };
        let Some(channel) = self.state.channel_id.clone() else {
            return self.stall();
        };
        let value = self.state.counter.current_count + 1;
        let label = self.identities[index].label.clone();
        let span = tracing::info_span!("send", identity = %label, value);

        if self.config.runner.presence {
            self.identities[index]
                .client()
                .indicate_presence(&channel)
                .instrument(span.clone())
                .await;
            if !self.pause(self.config.runner.presence_duration()).await {
                return;
            }
        }

        let delay = self.governor.jittered_delay(&mut self.rng);
        if !self.pause(delay).await {
            return;
        }

        let outcome = self.identities[index]
            .client()
            .send_value(&channel, value)
            .instrument(span.clone())
            .await;

        match outcome {
            Ok(receipt) => {
                self.last_network_ok = Instant::now();
                if self.config.scan.verify_sends
                    && !self.confirm_landed(index, value).instrument(span).await
                {
                    if self.token.is_cancelled() {
                        return;
                    }
                    self.pending_sender = None;
                    self.rate_limit_retries = 0;
                    self.governor.record(RateEvent::error());
                    self.events.emit(SupervisorEvent::SendUnconfirmed {
                        identity: label.clone(),
                        value,
                    });
                    self.report_failure(
                        "verify",
                        Some(label),
                        format!("value {} not found in the channel after sending", value),
                    );
                    self.set_phase(Phase::Scanning);
                    return;
                }
                self.identities[index].record_send(receipt.sent_at);
                let counter = &mut self.state.counter;
                counter.current_count = value;
                counter.last_identity_index = Some(index);
                counter.reset_pending = false;
                self.counts_this_session += 1;
                self.pending_sender = None;
                self.rate_limit_retries = 0;
                self.last_error = None;
                self.governor.record(RateEvent::success());

                tracing::info!(identity = %label, value, "sent");
                self.events.emit(SupervisorEvent::ValueSent {
                    identity: label,
                    value,
                });
                self.persist();

                self.sends_since_scan += 1;
                if self.sends_since_scan >= self.config.scan.scan_every {
                    self.sends_since_scan = 0;
                    self.set_phase(Phase::Scanning);
                } else {
                    self.set_phase(Phase::Deciding);
                }
            }
            Err(IdentityError::RateLimited {
                retry_after,
                global,
            }) => {
                let wait = self.note_rate_limit(&label, retry_after, global);
                self.rate_limit_retries += 1;
                let exhausted = self.rate_limit_retries > self.config.runner.max_rate_limit_retries;
                if !self.pause(wait).await {
                    return;
                }
                if exhausted {
                    self.pending_sender = None;
                    self.rate_limit_retries = 0;
                    self.report_failure(
                        "send",
                        Some(label),
                        format!(
                            "still rate limited after {} retries",
                            self.config.runner.max_rate_limit_retries
                        ),
                    );
                    self.set_phase(Phase::Scanning);
                }
                // Otherwise stay in Sending and retry the same value
            }
            Err(error) if error.is_authorization() => {
                self.pending_sender = None;
                self.governor.record(RateEvent::error());
                self.disable_identity(index, &error);
                self.set_phase(Phase::Deciding);
            }
            Err(error) => {
                self.pending_sender = None;
                self.cycle_failed("send", Some(label), error).await;
            }
        }
    }

    async fn cooldown(&mut self) {
        if let Some(signal) = self.pending_reset.take() {
            self.apply_reset(&signal);
        }
        if !self.pause(self.config.runner.cooldown()).await {
            return;
        }
        if self.state.auto_restart {
            tracing::info!("auto-restart: resuming from 1");
            self.set_phase(Phase::Scanning);
        } else {
            self.running = false;
            self.state.counter.counting_active = false;
            self.persist();
            self.set_phase(Phase::Idle);
        }
    }

    // ---- transitions and bookkeeping ----

    /// Sleep unless the current run is stopped; `false` when interrupted
    async fn pause(&self, duration: Duration) -> bool {
        signal::pause(&self.token, duration).await
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::debug!(from = %self.phase, to = %phase, "phase change");
            self.phase = phase;
            self.events.emit(SupervisorEvent::PhaseChanged { phase });
        }
        self.publish_status();
    }

    fn finish_stop(&mut self, phase: Phase) {
        self.running = false;
        self.pending_sender = None;
        self.pending_reset = None;
        self.state.counter.counting_active = false;
        self.persist();
        self.token = self.stop.rearm();
        tracing::info!(count = self.state.counter.current_count, "counting stopped");
        self.set_phase(phase);
    }

    fn stall(&mut self) {
        tracing::error!("no usable identity remains, counting stalled");
        self.last_error = Some(AutocountError::NoUsableIdentity.to_string());
        self.running = false;
        self.pending_sender = None;
        self.state.counter.counting_active = false;
        self.persist();
        self.set_phase(Phase::Stalled);
    }

    fn report_failure(&mut self, operation: &str, identity: Option<String>, cause: String) {
        tracing::warn!(operation, identity = ?identity, %cause, "cycle failed");
        self.last_error = Some(match &identity {
            Some(label) => format!("{} by {} failed: {}", operation, label, cause),
            None => format!("{} failed: {}", operation, cause),
        });
        self.events.emit(SupervisorEvent::CycleFailed {
            operation: operation.to_string(),
            identity,
            cause,
        });
        self.publish_status();
    }

    async fn cycle_failed(&mut self, operation: &str, identity: Option<String>, error: IdentityError) {
        self.governor.record(RateEvent::error());
        let transient = error.is_transient();
        self.report_failure(operation, identity, error.to_string());
        if transient {
            self.check_watchdog().await;
        }
        if self.pause(self.config.runner.error_backoff()).await {
            self.set_phase(Phase::Scanning);
        }
    }

    fn disable_identity(&mut self, index: usize, error: &IdentityError) {
        let identity = &mut self.identities[index];
        identity.mark_unusable(error.to_string());
        self.events.emit(SupervisorEvent::IdentityDisabled {
            identity: identity.label.clone(),
            reason: error.to_string(),
        });
        self.publish_status();
    }

    async fn check_watchdog(&mut self) {
        if self.last_network_ok.elapsed() >= self.config.runner.watchdog_timeout() {
            tracing::warn!(
                timeout = ?self.config.runner.watchdog_timeout(),
                "no successful network operation within the watchdog timeout"
            );
            self.reconnect_all().await;
            self.last_network_ok = Instant::now();
        }
    }

    async fn reconnect_all(&mut self) -> usize {
        let results =
            futures::future::join_all(self.identities.iter().map(|i| i.client().reconnect())).await;
        let mut reconnected = 0;
        for (identity, result) in self.identities.iter().zip(results) {
            match result {
                Ok(()) => reconnected += 1,
                Err(e) => tracing::warn!(identity = %identity.label, error = %e, "reconnect failed"),
            }
        }
        tracing::info!(reconnected, total = self.identities.len(), "sessions reconnected");
        self.events
            .emit(SupervisorEvent::Reconnected { identities: reconnected });
        reconnected
    }

    async fn authenticate_all(&mut self) {
        let results =
            futures::future::join_all(self.identities.iter().map(|i| i.client().authenticate()))
                .await;
        for (index, result) in results.into_iter().enumerate() {
            self.apply_authentication(index, result);
        }
    }

    fn apply_authentication(
        &mut self,
        index: usize,
        result: ClientResult<AccountInfo>,
    ) {
        match result {
            Ok(account) => {
                self.identities[index].user_id = Some(account.user_id);
            }
            Err(e) if e.is_authorization() => self.disable_identity(index, &e),
            Err(e) => {
                tracing::warn!(
                    identity = %self.identities[index].label,
                    error = %e,
                    "could not resolve account, matching by label"
                );
            }
        }
    }

    fn recency_window(&self) -> RecencyWindow {
        RecencyWindow::new(
            Utc::now(),
            Duration::from_secs(self.state.recency_window_secs),
        )
        .not_before(self.state.counter.last_reset_at)
    }

    /// Fetch recent items through the first usable identity
    ///
    /// An identity whose credential is rejected is disabled and the next one
    /// is tried.
    async fn fetch_items(&mut self, limit: u8) -> std::result::Result<Vec<ChannelItem>, FetchError> {
        let Some(channel) = self.state.channel_id.clone() else {
            return Err(FetchError::Failed {
                identity: String::new(),
                error: IdentityError::NotFound("no channel configured".to_string()),
            });
        };
        loop {
            let Some(index) = self.identities.iter().position(Identity::is_usable) else {
                return Err(FetchError::NoUsableIdentity);
            };
            let result = self.identities[index]
                .client()
                .fetch_recent(&channel, limit)
                .await;
            match result {
                Ok(items) => {
                    self.last_network_ok = Instant::now();
                    return Ok(items);
                }
                Err(e) if e.is_authorization() => self.disable_identity(index, &e),
                Err(error) => {
                    return Err(FetchError::Failed {
                        identity: self.identities[index].label.clone(),
                        error,
                    })
                }
            }
        }
    }

    /// [`Self::fetch_items`], waiting out rate limits the way sends do
    async fn fetch_paced(&mut self, limit: u8) -> std::result::Result<Vec<ChannelItem>, FetchError> {
        let mut retries = 0;
        loop {
            match self.fetch_items(limit).await {
                Err(FetchError::Failed {
                    identity,
                    error: IdentityError::RateLimited { retry_after, global },
                }) if retries < self.config.runner.max_rate_limit_retries => {
                    retries += 1;
                    let wait = self.note_rate_limit(&identity, retry_after, global);
                    if !self.pause(wait).await {
                        return Err(FetchError::Stopped);
                    }
                }
                other => return other,
            }
        }
    }

    /// Feed a rate limit to the governor and report it; returns the wait
    fn note_rate_limit(&mut self, identity: &str, retry_after: Duration, global: bool) -> Duration {
        let wait = match self
            .governor
            .record(RateEvent::rate_limited(retry_after, global))
        {
            Verdict::Wait(wait) => wait,
            Verdict::Proceed => retry_after,
        };
        self.events.emit(SupervisorEvent::RateLimited {
            identity: identity.to_string(),
            wait_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            global,
        });
        self.publish_status();
        wait
    }

    /// Whether `value` from identity `index` shows up among the newest items
    async fn confirm_landed(&mut self, index: usize, value: u64) -> bool {
        let items = match self.fetch_paced(self.config.scan.verify_fetch_limit).await {
            Ok(items) => items,
            Err(FetchError::Stopped) => return false,
            Err(e) => {
                let error = AutocountError::from(e);
                tracing::warn!(%error, "could not re-read the channel to confirm a send");
                return false;
            }
        };
        let expected = value.to_string();
        let identity = &self.identities[index];
        let landed = items.iter().any(|item| {
            !self.scanner.is_automated(item)
                && item.content.trim() == expected
                && identity.is_author(
                    Some(item.author_id.as_str()),
                    Some(item.author_name.as_str()),
                )
        });
        if !landed {
            tracing::warn!(sample = items.len(), "sent value not visible in the channel");
        }
        landed
    }

    fn author_index(&self, author_id: Option<&str>, author_name: Option<&str>) -> Option<usize> {
        self.identities
            .iter()
            .position(|i| i.is_author(author_id, author_name))
    }

    /// Adopt the greater of the local and observed counts
    fn reconcile(&mut self, observation: &Observation) {
        if observation.author_name.is_none() {
            return;
        }
        let local = self.state.counter.current_count;
        let observed = observation.observed_count;

        if observed.abs_diff(local) > self.config.scan.divergence_alert {
            tracing::warn!(local, observed, "local and observed counts diverge");
            self.events
                .emit(SupervisorEvent::Divergence { local, observed });
        }
        if observed < local {
            return;
        }

        let author = self.author_index(
            observation.author_id.as_deref(),
            observation.author_name.as_deref(),
        );
        let counter = &mut self.state.counter;
        if counter.current_count == observed && counter.last_identity_index == author {
            return;
        }
        if observed > local {
            tracing::info!(local, observed, author = ?observation.author_name, "adopting observed count");
        }
        counter.current_count = observed;
        counter.last_identity_index = author;
        self.persist();
        self.publish_status();
    }

    fn apply_reset(&mut self, signal: &ResetSignal) {
        tracing::warn!(
            author = %signal.author_name,
            observed_at = %signal.observed_at,
            previous = self.state.counter.current_count,
            "reset detected, next value is 1"
        );
        let counter = &mut self.state.counter;
        counter.current_count = 0;
        counter.reset_pending = true;
        counter.last_identity_index = None;
        counter.last_reset_at = Some(signal.observed_at);
        self.sends_since_scan = 0;
        self.events.emit(SupervisorEvent::ResetDetected {
            observed_at: signal.observed_at,
            author: signal.author_name.clone(),
        });
        self.persist();
        self.publish_status();
    }

    fn persist(&mut self) {
        self.state.identities = self.identities.iter().map(Identity::to_record).collect();
        if let Err(e) = self.store.save(&self.state) {
            tracing::error!(error = %e, "failed to persist state, will retry on next change");
            self.last_error = Some(e.to_string());
            self.events
                .emit(SupervisorEvent::PersistFailed { error: e.to_string() });
        }
    }

    fn publish_status(&self) {
        let counter = &self.state.counter;
        let snapshot = StatusSnapshot {
            phase: self.phase,
            current_count: counter.current_count,
            counting_active: counter.counting_active,
            identity_count: self.identities.len(),
            last_identity: counter
                .last_identity_index
                .and_then(|i| self.identities.get(i))
                .map(|i| i.label.clone()),
            unusable_identities: self
                .identities
                .iter()
                .filter(|i| !i.is_usable())
                .map(|i| i.label.clone())
                .collect(),
            current_delay: self.governor.current_delay(),
            recent_rate_limits: self.governor.recent_rate_limits(),
            counts_this_session: self.counts_this_session,
            last_error: self.last_error.clone(),
        };
        self.status.send_replace(snapshot);
    }

    // ---- commands ----

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Start {
                force,
                limit,
                reply,
            } => {
                let _ = reply.send(self.start(force, limit));
            }
            Command::Stop { reply } => {
                if self.running {
                    self.finish_stop(Phase::Stopped);
                } else {
                    self.token = self.stop.rearm();
                }
                let _ = reply.send(());
            }
            Command::ScanNow { reply } => {
                let result = self.scan_now().await;
                let _ = reply.send(result);
            }
            Command::FixMismatch { reply } => {
                let result = self.fix_mismatch().await;
                let _ = reply.send(result);
            }
            Command::DeepRescan { reply } => {
                let result = self.deep_rescan().await;
                let _ = reply.send(result);
            }
            Command::ReconnectAll { reply } => {
                let reconnected = self.reconnect_all().await;
                self.last_network_ok = Instant::now();
                let _ = reply.send(Ok(reconnected));
            }
            Command::SetAutoRestart { enabled, reply } => {
                self.state.auto_restart = enabled;
                self.persist();
                let _ = reply.send(Ok(()));
            }
            Command::SetChannel { channel_id, reply } => {
                let _ = reply.send(self.set_channel(channel_id));
            }
            Command::AddIdentity {
                label,
                token,
                user_agent,
                reply,
            } => {
                let result = self.add_identity(label, token, user_agent).await;
                let _ = reply.send(result);
            }
            Command::RemoveIdentity { label, reply } => {
                let _ = reply.send(self.remove_identity(&label));
            }
            Command::SetPacingBounds { min, max, reply } => {
                let _ = reply.send(self.set_pacing_bounds(min, max));
            }
            Command::SetCountLimit { limit, reply } => {
                let _ = reply.send(self.set_count_limit(limit));
            }
            Command::SetRunHours { hours, reply } => {
                self.state.run_hours = hours;
                self.persist();
                let _ = reply.send(Ok(()));
            }
            Command::AddParticipant { name, reply } => {
                let result = self.state.add_participant(&name).map(|()| {
                    tracing::info!(participant = %name.trim(), "automated participant added");
                    self.apply_participants();
                });
                let _ = reply.send(result);
            }
            Command::RemoveParticipant { name, reply } => {
                let result = self.state.remove_participant(&name).map(|removed| {
                    tracing::info!(participant = %removed, "automated participant removed");
                    self.apply_participants();
                });
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                if self.running {
                    self.finish_stop(Phase::Stopped);
                } else {
                    self.persist();
                }
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        self.publish_status();
        ControlFlow::Continue(())
    }

    fn start(&mut self, force: bool, limit: Option<u64>) -> Result<()> {
        if self.running {
            return Ok(());
        }
        if limit == Some(0) {
            return Err(AutocountError::InvalidInput(
                "count limit must be positive".to_string(),
            ));
        }
        if self.state.channel_id.is_none() {
            return Err(AutocountError::FatalConfiguration(
                "no channel set".to_string(),
            ));
        }
        if self.identities.is_empty() {
            return Err(AutocountError::FatalConfiguration(
                "no identities configured".to_string(),
            ));
        }
        let usable: Vec<bool> = self.identities.iter().map(Identity::is_usable).collect();
        if !IdentityRotator::any_usable(&usable) {
            return Err(AutocountError::NoUsableIdentity);
        }

        self.token = self.stop.rearm();
        self.running = true;
        self.session_limit = limit;
        self.pending_sender = None;
        self.pending_reset = None;
        self.rate_limit_retries = 0;
        self.sends_since_scan = 0;
        self.counts_this_session = 0;
        self.last_error = None;
        self.last_network_ok = Instant::now();
        self.state.counter.counting_active = true;

        if force {
            // Anything posted before now is history, including reset messages
            self.state.counter.last_reset_at = Some(Utc::now());
            tracing::info!(count = self.state.counter.current_count, "force start, skipping initial scan");
            self.persist();
            self.set_phase(Phase::Deciding);
        } else {
            tracing::info!(count = self.state.counter.current_count, "starting");
            self.persist();
            self.set_phase(Phase::Scanning);
        }
        Ok(())
    }

    async fn scan_now(&mut self) -> Result<ScanResult> {
        self.require_ready()?;
        let items = self.fetch_paced(self.config.scan.fetch_limit).await?;
        let signal = self.detector.detect(&items, self.recency_window());
        let observation = self.scanner.scan(&items, self.state.counter.last_reset_at);
        Ok(scan_result(&observation, signal.map(|s| s.observed_at)))
    }

    /// Take the count from the last few messages, even if it is lower
    ///
    /// A reset found in the batch is applied first; values posted after it
    /// are then adopted like any other.
    async fn fix_mismatch(&mut self) -> Result<ScanResult> {
        self.require_ready()?;
        let items = self.fetch_paced(self.config.scan.fix_fetch_limit).await?;
        let signal = self.detector.detect(&items, self.recency_window());
        if let Some(signal) = &signal {
            self.apply_reset(signal);
        }

        let observation = self.scanner.scan(&items, self.state.counter.last_reset_at);
        if observation.author_name.is_some() {
            let previous = self.state.counter.current_count;
            let author = self.author_index(
                observation.author_id.as_deref(),
                observation.author_name.as_deref(),
            );
            let counter = &mut self.state.counter;
            counter.current_count = observation.observed_count;
            counter.last_identity_index = author;
            // Counting already resumed after the reset
            counter.reset_pending &= observation.observed_count == 0;
            tracing::warn!(previous, corrected = observation.observed_count, "count corrected");
            self.persist();
        } else if signal.is_none() {
            tracing::warn!("no count found to correct against");
        }
        Ok(scan_result(&observation, signal.map(|s| s.observed_at)))
    }

    async fn deep_rescan(&mut self) -> Result<ScanResult> {
        self.require_ready()?;
        let items = self.fetch_paced(self.config.scan.deep_fetch_limit).await?;
        let window =
            RecencyWindow::unbounded(Utc::now()).not_before(self.state.counter.last_reset_at);
        let signal = self.detector.detect(&items, window);
        if let Some(signal) = &signal {
            self.apply_reset(signal);
        } else {
            tracing::info!(sample = items.len(), "deep rescan found no reset");
        }
        let observation = self.scanner.scan(&items, self.state.counter.last_reset_at);
        Ok(scan_result(&observation, signal.map(|s| s.observed_at)))
    }

    fn require_ready(&self) -> Result<()> {
        if self.state.channel_id.is_none() {
            return Err(AutocountError::FatalConfiguration(
                "no channel set".to_string(),
            ));
        }
        if self.identities.is_empty() {
            return Err(AutocountError::FatalConfiguration(
                "no identities configured".to_string(),
            ));
        }
        Ok(())
    }

    fn set_channel(&mut self, channel_id: String) -> Result<()> {
        let channel_id = channel_id.trim().to_string();
        if channel_id.is_empty() {
            return Err(AutocountError::InvalidInput(
                "channel id cannot be empty".to_string(),
            ));
        }
        tracing::info!(channel = %channel_id, "channel set");
        self.state.channel_id = Some(channel_id);
        self.persist();
        Ok(())
    }

    async fn add_identity(
        &mut self,
        label: String,
        token: String,
        user_agent: Option<String>,
    ) -> Result<()> {
        let label = label.trim().to_string();
        let token = token.trim().to_string();
        if label.is_empty() || token.is_empty() {
            return Err(AutocountError::InvalidInput(
                "identity label and token are required".to_string(),
            ));
        }
        if self.identities.iter().any(|i| i.label == label) {
            return Err(AutocountError::InvalidInput(format!(
                "an identity labelled '{}' already exists",
                label
            )));
        }
        if self.identities.iter().any(|i| i.has_credential(&token)) {
            return Err(AutocountError::InvalidInput(
                "this token is already configured for another identity".to_string(),
            ));
        }

        let record = IdentityRecord {
            label,
            token,
            user_agent: user_agent.filter(|ua| !ua.trim().is_empty()),
            message_count: 0,
        };
        let client = self.factory.create(&record)?;
        self.identities.push(Identity::new(&record, client));

        let index = self.identities.len() - 1;
        let result = self.identities[index].client().authenticate().await;
        self.apply_authentication(index, result);

        tracing::info!(identity = %record.label, "identity added");
        self.persist();
        Ok(())
    }

    fn remove_identity(&mut self, label: &str) -> Result<()> {
        let Some(index) = self.identities.iter().position(|i| i.label == label) else {
            return Err(AutocountError::InvalidInput(format!(
                "no identity labelled '{}'",
                label
            )));
        };
        self.identities.remove(index);

        let counter = &mut self.state.counter;
        counter.last_identity_index = match counter.last_identity_index {
            Some(last) if last == index => None,
            Some(last) if last > index => Some(last - 1),
            other => other,
        };
        if self.pending_sender.is_some() {
            self.pending_sender = None;
            if self.phase == Phase::Sending {
                self.set_phase(Phase::Deciding);
            }
        }

        tracing::info!(identity = %label, "identity removed");
        self.persist();
        Ok(())
    }

    fn set_pacing_bounds(&mut self, min: Duration, max: Duration) -> Result<()> {
        self.governor.set_bounds(min, max)?;
        self.state.pacing = PacingBounds {
            min_delay_ms: min.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
        };
        self.persist();
        Ok(())
    }

    fn apply_participants(&mut self) {
        let participants = self.state.automated_participants.clone();
        self.scanner.set_participants(participants.clone());
        self.detector.set_participants(participants);
        self.persist();
    }

    fn set_count_limit(&mut self, limit: Option<u64>) -> Result<()> {
        if limit == Some(0) {
            return Err(AutocountError::InvalidInput(
                "count limit must be positive".to_string(),
            ));
        }
        self.state.count_limit = limit;
        self.persist();
        Ok(())
    }
}
