//! Secondary Assessment Inference
//!
//! Alongside the conversational agent, a text-only model re-reads the
//! transcript after every user turn and produces its own assessment update.
//! Its output is fed into the same reducer queue as the agent's tool calls,
//! tagged with a reserved call-id prefix so that no conversational
//! acknowledgement is sent for it. Each injected update also carries an
//! `_inference` provenance record naming the model and hashing the body.

use crate::model::InferenceProvenance;
use crate::payload::strip_wrapping;
use crate::protocol::InboundEvent;
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Call-id prefix reserved for updates that did not come from the agent.
pub const SIDECAR_CALL_PREFIX: &str = "sidecar_";

pub fn is_sidecar_call(call_id: &str) -> bool {
    call_id.starts_with(SIDECAR_CALL_PREFIX)
}

pub fn sidecar_call_id(unix_millis: i64) -> String {
    format!("{SIDECAR_CALL_PREFIX}{unix_millis}")
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// One completed utterance in the running transcript.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TranscriptTurn {
    pub role: Speaker,
    pub content: String,
}

pub const SIDECAR_SOURCE: &str = "sidecar";

/// What a secondary model produced for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    /// Model that produced the update.
    pub model: String,
    /// Raw tool-call arguments as JSON text, possibly fence-wrapped.
    pub arguments: String,
}

/// Wraps secondary-inference output as if the agent had called the tool.
pub fn injected_tool_call(tool_name: &str, assessment: Assessment) -> InboundEvent {
    let now = Utc::now();
    let call_id = sidecar_call_id(now.timestamp_millis());
    let arguments = match with_provenance(&assessment, &call_id, now) {
        Some(signed) => signed,
        None => {
            debug!(call_id = %call_id, "Assessment is not a JSON object; injecting as-is");
            assessment.arguments
        }
    };
    InboundEvent::FunctionCallArgumentsDone {
        name: Some(tool_name.to_string()),
        arguments,
        call_id,
    }
}

/// First 16 hex digits of the SHA-256 of `body`.
pub fn data_hash(body: &str) -> String {
    let mut hex = format!("{:x}", Sha256::digest(body.as_bytes()));
    hex.truncate(16);
    hex
}

fn with_provenance(assessment: &Assessment, call_id: &str, at: DateTime<Utc>) -> Option<String> {
    let mut value: serde_json::Value =
        serde_json::from_str(strip_wrapping(&assessment.arguments)).ok()?;
    let body = serde_json::to_string(&value).ok()?;
    let provenance = InferenceProvenance {
        source: SIDECAR_SOURCE.to_string(),
        model: assessment.model.clone(),
        timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
        call_id: call_id.to_string(),
        data_hash: data_hash(&body),
    };
    value
        .as_object_mut()?
        .insert("_inference".to_string(), serde_json::to_value(provenance).ok()?);
    serde_json::to_string(&value).ok()
}

/// Defines the contract for a model that produces assessment updates from a transcript.
#[async_trait]
pub trait AssessmentInference: Send + Sync {
    /// Analyzes the latest turn in context.
    ///
    /// # Arguments
    ///
    /// * `history` - Every completed turn so far, oldest first.
    ///
    /// # Returns
    ///
    /// The model's update. Code fences in `arguments` are tolerated.
    async fn analyze(&self, history: &[TranscriptTurn]) -> Result<Assessment>;
}

/// An `AssessmentInference` backed by any OpenAI-compatible chat completion API.
pub struct OpenAICompatibleAssessor {
    client: Client<OpenAIConfig>,
    model: String,
    system_prompt: String,
}

impl OpenAICompatibleAssessor {
    /// # Arguments
    ///
    /// * `config` - API key and base URL; point it at any compatible provider.
    /// * `model` - Model identifier.
    /// * `system_prompt` - Instructions describing the expected JSON update.
    pub fn new(config: OpenAIConfig, model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            client: Client::with_config(config),
            model: model.into(),
            system_prompt: system_prompt.into(),
        }
    }
}

#[async_trait]
impl AssessmentInference for OpenAICompatibleAssessor {
    async fn analyze(&self, history: &[TranscriptTurn]) -> Result<Assessment> {
        let transcript = serde_json::to_string_pretty(history)?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(0.6)
            .messages(vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(self.system_prompt.as_str())
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(format!(
                        "Current Conversation History:\n{transcript}\n\nAnalyze the latest turn and provide the JSON update."
                    ))
                    .build()?
                    .into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;

        let answer = response
            .choices
            .first()
            .context("No response choice from assessment model")?
            .message
            .content
            .clone()
            .context("No content in assessment model response")?;
        Ok(Assessment {
            model: self.model.clone(),
            arguments: answer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_prefix() {
        assert!(is_sidecar_call(&sidecar_call_id(1_700_000_000_000)));
        assert_eq!(sidecar_call_id(42), "sidecar_42");
        assert!(!is_sidecar_call("call_abc"));
    }

    fn assessment(arguments: &str) -> Assessment {
        Assessment {
            model: "llama-3.3-70b-versatile".to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[test]
    fn test_injected_call_carries_provenance() {
        let event = injected_tool_call(
            "updateAssessmentState",
            assessment("```json\n{\"phase\":\"CORE\"}\n```"),
        );
        let InboundEvent::FunctionCallArgumentsDone { name, arguments, call_id } = event else {
            panic!("unexpected event");
        };
        assert_eq!(name.as_deref(), Some("updateAssessmentState"));
        assert!(is_sidecar_call(&call_id));

        let value: serde_json::Value = serde_json::from_str(&arguments).unwrap();
        assert_eq!(value["phase"], "CORE");
        let provenance: InferenceProvenance =
            serde_json::from_value(value["_inference"].clone()).unwrap();
        assert_eq!(provenance.source, "sidecar");
        assert_eq!(provenance.model, "llama-3.3-70b-versatile");
        assert_eq!(provenance.call_id, call_id);
        assert_eq!(provenance.data_hash, data_hash(r#"{"phase":"CORE"}"#));
        assert!(provenance.timestamp.ends_with('Z'));
    }

    #[test]
    fn test_unparseable_assessment_is_injected_unchanged() {
        let event = injected_tool_call("updateAssessmentState", assessment("no update this turn"));
        let InboundEvent::FunctionCallArgumentsDone { arguments, .. } = event else {
            panic!("unexpected event");
        };
        assert_eq!(arguments, "no update this turn");
    }

    #[test]
    fn test_data_hash_is_short_sha256_hex() {
        // sha256("abc")
        assert_eq!(data_hash("abc"), "ba7816bf8f01cfea");
        assert_eq!(data_hash("{}").len(), 16);
    }

    #[test]
    fn test_transcript_wire_shape() {
        let turn = TranscriptTurn {
            role: Speaker::Assistant,
            content: "Tell me more.".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&turn).unwrap(),
            serde_json::json!({"role": "assistant", "content": "Tell me more."})
        );
    }
}
