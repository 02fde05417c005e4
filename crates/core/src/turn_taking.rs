//! Turn-Taking State Machine
//!
//! Tracks whether the remote agent is speaking and gates microphone capture:
//! nothing is forwarded while the agent talks or during the echo cooldown that
//! follows. A remote "user started speaking" signal always wins and produces a
//! barge-in.

use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default echo-suppression window after the agent stops speaking.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AgentSpeaking,
    Cooldown { since: Instant },
}

/// Wire-friendly view of `TurnState`.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Idle,
    AgentSpeaking,
    Cooldown,
}

impl From<TurnState> for TurnPhase {
    fn from(state: TurnState) -> Self {
        match state {
            TurnState::Idle => TurnPhase::Idle,
            TurnState::AgentSpeaking => TurnPhase::AgentSpeaking,
            TurnState::Cooldown { .. } => TurnPhase::Cooldown,
        }
    }
}

/// Emitted when the user interrupts. Consumers stop playback and clear the
/// remote input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BargeIn {
    /// Whether the agent was audibly speaking when interrupted.
    pub interrupted_speech: bool,
}

#[derive(Debug, Clone)]
pub struct TurnTaking {
    state: TurnState,
    cooldown: Duration,
}

impl TurnTaking {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: TurnState::Idle,
            cooldown,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// An inbound agent audio chunk arrived. Returns true on the first chunk of a response.
    pub fn on_agent_audio(&mut self) -> bool {
        if self.state == TurnState::AgentSpeaking {
            return false;
        }
        debug!(from = ?self.state, "Agent started speaking");
        self.state = TurnState::AgentSpeaking;
        true
    }

    /// Playback drained and its grace period elapsed.
    pub fn on_agent_finished(&mut self, now: Instant) {
        if self.state == TurnState::AgentSpeaking {
            debug!("Agent finished speaking; entering cooldown");
            self.state = TurnState::Cooldown { since: now };
        }
    }

    /// The remote detected the user speaking. Unconditional and immediate.
    pub fn on_user_speech_started(&mut self) -> BargeIn {
        let interrupted_speech = self.state == TurnState::AgentSpeaking;
        if interrupted_speech {
            info!("Barge-in: user interrupted the agent");
        }
        self.state = TurnState::Idle;
        BargeIn { interrupted_speech }
    }

    /// Ends an expired cooldown. Returns true when the state changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        if let TurnState::Cooldown { since } = self.state {
            if now.saturating_duration_since(since) >= self.cooldown {
                self.state = TurnState::Idle;
                return true;
            }
        }
        false
    }

    /// Whether a microphone frame captured at `now` may be forwarded.
    pub fn capture_allowed(&self, now: Instant) -> bool {
        match self.state {
            TurnState::Idle => true,
            TurnState::AgentSpeaking => false,
            TurnState::Cooldown { since } => now.saturating_duration_since(since) >= self.cooldown,
        }
    }
}

impl Default for TurnTaking {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
