//! Realtime Transport Protocol
//!
//! Serde types for the JSON events exchanged with the remote voice agent.
//! Only the events the engine acts on are modelled; everything else
//! deserializes to `InboundEvent::Other` and is ignored.

use crate::payload::ToolArguments;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the single function tool advertised to the agent.
pub const ASSESSMENT_TOOL_NAME: &str = "updateAssessmentState";

const ASSESSMENT_TOOL_DESCRIPTION: &str = "Record what the latest user turn revealed: dimension \
     scores, evidence, narrative fragments and their interpretations, the conversation phase, \
     and whether the assessment is complete.";

// --- Session Configuration ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f64,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TranscriptionConfig {
    pub model: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    /// The assessment tool, with parameters generated from `ToolArguments`.
    pub fn assessment(name: &str) -> Self {
        let mut parameters = serde_json::to_value(schemars::schema_for!(ToolArguments))
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
        if let Value::Object(map) = &mut parameters {
            map.remove("$schema");
            map.remove("title");
            map.remove("description");
        }
        Self {
            kind: "function".to_string(),
            name: name.to_string(),
            description: ASSESSMENT_TOOL_DESCRIPTION.to_string(),
            parameters,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionConfig,
    pub turn_detection: TurnDetection,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: String,
}

impl SessionConfig {
    pub fn new(instructions: impl Into<String>, voice: impl Into<String>, tool_name: &str) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: instructions.into(),
            voice: voice.into(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: TranscriptionConfig {
                model: "whisper-1".to_string(),
            },
            turn_detection: TurnDetection::default(),
            tools: vec![ToolDefinition::assessment(tool_name)],
            tool_choice: "auto".to_string(),
        }
    }
}

// --- Outbound ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    FunctionCallOutput { call_id: String, output: String },
}

/// Events the engine sends to the remote agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl OutboundEvent {
    pub fn function_call_output(call_id: impl Into<String>, output: &Value) -> Self {
        OutboundEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.to_string(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::SessionUpdate { .. } => "session.update",
            OutboundEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            OutboundEvent::InputAudioBufferClear => "input_audio_buffer.clear",
            OutboundEvent::ConversationItemCreate { .. } => "conversation.item.create",
            OutboundEvent::ResponseCreate => "response.create",
        }
    }
}

// --- Inbound ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorDetail {
    pub message: String,
}

/// Events the engine reacts to from the remote agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        /// Absent on some provider versions; then the single declared tool is assumed.
        #[serde(default)]
        name: Option<String>,
        arguments: String,
        call_id: String,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    UserTranscriptCompleted {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.audio_transcript.done")]
    AgentTranscriptDone {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<ErrorDetail>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Other,
}

impl InboundEvent {
    /// The human-readable message of an `error` event, in either wire shape.
    pub fn error_message(&self) -> Option<String> {
        match self {
            InboundEvent::Error { error, message } => Some(
                error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .or_else(|| message.clone())
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
            _ => None,
        }
    }
}
