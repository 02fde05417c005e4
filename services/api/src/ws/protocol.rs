//! Defines the WebSocket message protocol between the browser client and the API server.
//!
//! Text frames carry the JSON messages below. Binary frames from the client
//! carry little-endian PCM16 mono microphone samples at the rate announced in
//! `init`.

use scope_core::{
    EngineEvent,
    capture::MicrophonePermission,
    collaborator::FinalizeOutcome,
    lifecycle::ConnectionState,
    model::SessionState,
    turn_taking::TurnPhase,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Starts the session. This must be the first message.
    Init {
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        /// Outcome of the browser's microphone permission prompt.
        microphone: MicrophonePermission,
        /// Where results are sent if the session is cut off before an explicit finalize.
        #[serde(default)]
        destination: Option<String>,
    },
    SetMuted { muted: bool },
    Pause,
    Resume,
    /// Hands the session to the review pipeline and ends it.
    Finalize { destination: String },
    /// Ends the session without results.
    End,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Initialized {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
    },
    Lifecycle { state: ConnectionState },
    /// Pushes the complete assessment state after every applied update.
    StateUpdate { state: SessionState },
    /// Agent audio (base64 PCM16, 24 kHz) to start at `startAt` seconds on the playback timeline.
    AudioChunk {
        handle: u64,
        #[serde(rename = "startAt")]
        start_at: f64,
        data: String,
    },
    /// Stop these handles now; the user barged in.
    Interrupt { handles: Vec<u64> },
    InputLevel {
        rms: f32,
        #[serde(rename = "belowThreshold")]
        below_threshold: bool,
        #[serde(rename = "echoLikelihood")]
        echo_likelihood: f32,
    },
    Turn { state: TurnPhase },
    EarlyExitAvailable,
    CutoffReached,
    Finalized { outcome: FinalizeOutcome },
    /// A non-fatal notice, e.g. a dropped malformed update.
    Diagnostic { message: String },
    Error { message: String },
}

impl From<EngineEvent> for ServerMessage {
    fn from(event: EngineEvent) -> Self {
        match event {
            EngineEvent::Lifecycle(state) => ServerMessage::Lifecycle { state },
            EngineEvent::StateUpdated(state) => ServerMessage::StateUpdate {
                state: (*state).clone(),
            },
            EngineEvent::AudioChunk {
                handle,
                start_at,
                data,
            } => ServerMessage::AudioChunk {
                handle,
                start_at,
                data,
            },
            EngineEvent::Interrupt { handles } => ServerMessage::Interrupt { handles },
            EngineEvent::InputLevel {
                level,
                echo_likelihood,
            } => ServerMessage::InputLevel {
                rms: level.rms,
                below_threshold: level.below_threshold,
                echo_likelihood,
            },
            EngineEvent::Turn(state) => ServerMessage::Turn { state },
            EngineEvent::EarlyExitAvailable => ServerMessage::EarlyExitAvailable,
            EngineEvent::CutoffReached => ServerMessage::CutoffReached,
            EngineEvent::Finalized(outcome) => ServerMessage::Finalized { outcome },
            EngineEvent::Diagnostic(message) => ServerMessage::Diagnostic { message },
            EngineEvent::Error(message) => ServerMessage::Error { message },
        }
    }
}
