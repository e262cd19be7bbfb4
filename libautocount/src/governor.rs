//! Adaptive pacing for outbound sends
//!
//! The governor turns a stream of send outcomes into a pacing delay. Runs of
//! successes slowly shrink the delay toward `min_delay`; a rate limit grows it
//! immediately toward `max_delay`. The service's own `retry_after` is always
//! honored when it is longer than the internal delay.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::GovernorConfig;
use crate::error::{AutocountError, Result};
use crate::types::{RateEvent, RateEventKind};

const HISTORY_LEN: usize = 32;

/// Largest pacing bound accepted
pub const MAX_PACING_DELAY: Duration = Duration::from_secs(3600);

/// Governor state, always within `[min_delay, max_delay]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedState {
    pub current_delay: Duration,
    pub consecutive_successes: u32,
    pub consecutive_rate_limits: u32,
}

/// What the caller has to do after feeding an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue with the normal pacing delay
    Proceed,
    /// Wait at least this long before the next send
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct SpeedGovernor {
    min_delay: Duration,
    max_delay: Duration,
    tuning: GovernorConfig,
    state: SpeedState,
    history: VecDeque<RateEvent>,
}

impl SpeedGovernor {
    pub fn new(min_delay: Duration, max_delay: Duration, tuning: GovernorConfig) -> Result<Self> {
        check_bounds(min_delay, max_delay)?;
        Ok(Self {
            min_delay,
            max_delay,
            tuning,
            state: SpeedState {
                current_delay: min_delay,
                consecutive_successes: 0,
                consecutive_rate_limits: 0,
            },
            history: VecDeque::with_capacity(HISTORY_LEN),
        })
    }

    pub fn state(&self) -> SpeedState {
        self.state
    }

    pub fn current_delay(&self) -> Duration {
        self.state.current_delay
    }

    /// Rate limits among the recent events
    pub fn recent_rate_limits(&self) -> usize {
        self.history
            .iter()
            .filter(|e| e.kind == RateEventKind::RateLimited)
            .count()
    }

    /// Change the pacing bounds, clamping the current delay into them
    pub fn set_bounds(&mut self, min_delay: Duration, max_delay: Duration) -> Result<()> {
        check_bounds(min_delay, max_delay)?;
        self.min_delay = min_delay;
        self.max_delay = max_delay;
        self.state.current_delay = self.state.current_delay.clamp(min_delay, max_delay);
        Ok(())
    }

    /// Feed one outcome into the controller
    pub fn record(&mut self, event: RateEvent) -> Verdict {
        let verdict = match event.kind {
            RateEventKind::Success => {
                self.state.consecutive_successes += 1;
                self.state.consecutive_rate_limits = 0;
                if self.state.consecutive_successes >= self.tuning.success_threshold {
                    let faster = scale(self.state.current_delay, self.tuning.decrease_factor);
                    self.state.current_delay = faster.max(self.min_delay);
                    self.state.consecutive_successes = 0;
                    tracing::debug!(delay = ?self.state.current_delay, "pacing sped up");
                }
                Verdict::Proceed
            }
            RateEventKind::RateLimited => {
                self.state.consecutive_successes = 0;
                self.state.consecutive_rate_limits += 1;

                let mut factor = self.tuning.increase_factor;
                if event.is_global {
                    factor *= self.tuning.global_penalty;
                }
                // A zero min_delay would never grow multiplicatively
                let base = self.state.current_delay.max(Duration::from_millis(1));
                self.state.current_delay = scale(base, factor).min(self.max_delay);

                let declared = event
                    .retry_after
                    .unwrap_or(Duration::ZERO)
                    .saturating_add(Duration::from_millis(self.tuning.retry_cushion_ms));
                let wait = declared.max(self.state.current_delay);
                tracing::warn!(
                    delay = ?self.state.current_delay,
                    wait = ?wait,
                    global = event.is_global,
                    "pacing slowed after rate limit"
                );
                Verdict::Wait(wait)
            }
            RateEventKind::Error => Verdict::Proceed,
        };

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(event);
        verdict
    }

    /// Pacing delay with multiplicative jitter applied, never below `min_delay`
    pub fn jittered_delay<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let jitter = self.tuning.jitter;
        if jitter <= 0.0 {
            return self.state.current_delay;
        }
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        scale(self.state.current_delay, factor).max(self.min_delay)
    }
}

/// `duration * factor`, saturating instead of panicking on overflow
fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

fn check_bounds(min_delay: Duration, max_delay: Duration) -> Result<()> {
    if min_delay > max_delay {
        return Err(AutocountError::InvalidInput(format!(
            "minimum delay {:?} exceeds maximum delay {:?}",
            min_delay, max_delay
        )));
    }
    if max_delay > MAX_PACING_DELAY {
        return Err(AutocountError::InvalidInput(format!(
            "maximum delay {:?} exceeds the {:?} limit",
            max_delay, MAX_PACING_DELAY
        )));
    }
    Ok(())
}
