//! Session Lifecycle Controller
//!
//! Owns the connection state machine and the two session timers. The hard
//! cutoff runs on wall time from the moment the transport came up and keeps
//! running through pauses and after completion. Active time, which excludes
//! pauses, drives the early-exit window and stamps score points.

use crate::collaborator::FinalizePayload;
use crate::model::SessionState;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_HARD_CUTOFF: Duration = Duration::from_secs(20 * 60);
pub const DEFAULT_EARLY_EXIT_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { paused: bool },
    Complete,
    Error { message: String },
}

impl ConnectionState {
    fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected { paused: false } => "connected",
            ConnectionState::Connected { paused: true } => "paused",
            ConnectionState::Complete => "complete",
            ConnectionState::Error { .. } => "error",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("cannot {action} while {from}")]
    InvalidTransition { from: &'static str, action: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// Wall time since connect reached the hard cutoff. The session must end now.
    HardCutoff,
    /// The user may end early: enough time has passed and every dimension is HIGH.
    EarlyExitAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub hard_cutoff: Duration,
    pub early_exit_after: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            hard_cutoff: DEFAULT_HARD_CUTOFF,
            early_exit_after: DEFAULT_EARLY_EXIT_AFTER,
        }
    }
}

#[derive(Debug)]
pub struct SessionLifecycle {
    config: LifecycleConfig,
    state: ConnectionState,
    started_at: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
    early_exit_announced: bool,
    cutoff_reached: bool,
}

impl SessionLifecycle {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            started_at: None,
            paused_at: None,
            paused_total: Duration::ZERO,
            early_exit_announced: false,
            cutoff_reached: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { paused: true })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    fn invalid(&self, action: &'static str) -> LifecycleError {
        LifecycleError::InvalidTransition {
            from: self.state.name(),
            action,
        }
    }

    /// Starts a new session attempt. Allowed from `Disconnected` or `Error`.
    pub fn connect(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Error { .. } => {
                self.reset_timers();
                self.state = ConnectionState::Connecting;
                info!("Session connecting");
                Ok(())
            }
            _ => Err(self.invalid("connect")),
        }
    }

    /// The transport is up. Starts the elapsed-time clock.
    pub fn on_connected(&mut self, now: Instant) -> Result<(), LifecycleError> {
        if self.state != ConnectionState::Connecting {
            return Err(self.invalid("finish connecting"));
        }
        self.started_at = Some(now);
        self.state = ConnectionState::Connected { paused: false };
        info!("Session connected");
        Ok(())
    }

    /// Suspends the elapsed-time clock. Pausing twice is a no-op.
    pub fn pause(&mut self, now: Instant) -> Result<(), LifecycleError> {
        match self.state {
            ConnectionState::Connected { paused: true } => Ok(()),
            ConnectionState::Connected { paused: false } => {
                self.paused_at = Some(now);
                self.state = ConnectionState::Connected { paused: true };
                info!(elapsed_secs = self.elapsed(now).as_secs(), "Session paused");
                Ok(())
            }
            _ => Err(self.invalid("pause")),
        }
    }

    pub fn resume(&mut self, now: Instant) -> Result<(), LifecycleError> {
        match self.state {
            ConnectionState::Connected { paused: false } => Ok(()),
            ConnectionState::Connected { paused: true } => {
                if let Some(at) = self.paused_at.take() {
                    self.paused_total += now.saturating_duration_since(at);
                }
                self.state = ConnectionState::Connected { paused: false };
                info!(elapsed_secs = self.elapsed(now).as_secs(), "Session resumed");
                Ok(())
            }
            _ => Err(self.invalid("resume")),
        }
    }

    /// Wall time since the transport came up, pauses included.
    pub fn wall_elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default()
    }

    /// Connected time excluding pauses.
    pub fn elapsed(&self, now: Instant) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        let reference = self.paused_at.unwrap_or(now);
        reference
            .saturating_duration_since(started)
            .saturating_sub(self.paused_total)
    }

    /// Checks both timers. Each signal fires at most once per session.
    ///
    /// The cutoff is checked while connected (paused or not) and once complete.
    /// Early exit is only offered while connected.
    pub fn tick(&mut self, now: Instant, session: &SessionState) -> Option<LifecycleSignal> {
        if !self.is_connected() && self.state != ConnectionState::Complete {
            return None;
        }

        let wall = self.wall_elapsed(now);
        if !self.cutoff_reached && wall >= self.config.hard_cutoff {
            self.cutoff_reached = true;
            warn!(
                wall_secs = wall.as_secs(),
                state = self.state.name(),
                "Hard session cutoff reached"
            );
            return Some(LifecycleSignal::HardCutoff);
        }

        if !self.is_connected() {
            return None;
        }
        let elapsed = self.elapsed(now);
        if !self.early_exit_announced
            && elapsed >= self.config.early_exit_after
            && session.all_dimensions_confident()
        {
            self.early_exit_announced = true;
            info!(elapsed_secs = elapsed.as_secs(), "Early exit available");
            return Some(LifecycleSignal::EarlyExitAvailable);
        }

        None
    }

    /// The agent marked the assessment complete.
    pub fn complete(&mut self) -> Result<(), LifecycleError> {
        if !self.is_connected() {
            return Err(self.invalid("complete"));
        }
        self.state = ConnectionState::Complete;
        info!("Session complete");
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(%message, "Session failed");
        self.state = ConnectionState::Error { message };
    }

    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            info!(from = self.state.name(), "Session disconnected");
        }
        self.state = ConnectionState::Disconnected;
        self.reset_timers();
    }

    /// Builds the review payload. Only a live or completed session has results to hand over.
    pub fn finalize(
        &self,
        session: &SessionState,
        destination: impl Into<String>,
    ) -> Result<FinalizePayload, LifecycleError> {
        match self.state {
            ConnectionState::Connected { .. } | ConnectionState::Complete => {
                Ok(FinalizePayload::project(session, destination))
            }
            _ => Err(self.invalid("finalize")),
        }
    }

    fn reset_timers(&mut self) {
        self.started_at = None;
        self.paused_at = None;
        self.paused_total = Duration::ZERO;
        self.early_exit_announced = false;
        self.cutoff_reached = false;
    }
}

impl Default for SessionLifecycle {
    fn default() -> Self {
        Self::new(LifecycleConfig::default())
    }
}
