//! Tool-Call Payload Decoding
//!
//! The remote agent emits `updateAssessmentState` arguments as a loosely typed
//! JSON string. This module turns that string into a validated
//! `ToolCallPayload`: every sub-update is optional, but whatever is present is
//! type-checked and resolved against the fixed dimension set. Malformed input
//! is rejected with a `PayloadDecodeError` instead of being defaulted.

use crate::model::{
    Confidence, ContradictionAlert, ConversationPhase, DimKey, Energy, EvidenceItem, EvidenceKind,
    GrandNarrative, InferenceProvenance, QuantumState, TemporalLayer, Tone, Trend, YamaResonance,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Errors raised while decoding tool-call arguments.
#[derive(Debug, thiserror::Error)]
pub enum PayloadDecodeError {
    #[error("arguments are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("arguments failed validation: {0}")]
    Invalid(String),
}

// --- Wire Shape ---

/// Partial update for a single dimension. Absent fields keep their current value.
#[derive(Deserialize, JsonSchema, Debug, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DimensionUpdate {
    /// Score between 0 and 5; 2.5 is the neutral baseline.
    pub score: Option<f64>,
    pub confidence: Option<Confidence>,
    pub evidence_count: Option<u32>,
    pub trend: Option<Trend>,
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
pub struct EvidenceArgs {
    /// One of S, C, O, P, E.
    pub dimension: String,
    #[serde(rename = "type")]
    pub kind: EvidenceKind,
    /// One sentence describing the evidence found in this turn.
    pub summary: String,
    /// Conversation clock label, `MM:SS`.
    pub timestamp: String,
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ContradictionArgs {
    pub dimension: String,
    pub early_statement: String,
    pub late_statement: String,
    pub resolution: String,
}

#[derive(Deserialize, JsonSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FragmentArgs {
    pub id: String,
    pub text: String,
    pub tone: Tone,
    pub energy: Energy,
    /// Identifiers of earlier fragments this one connects to.
    #[serde(default)]
    pub entangled_with: Vec<String>,
}

/// Arguments of the `updateAssessmentState` tool exactly as the agent sends them.
///
/// The JSON schema advertised to the agent in `session.update` is generated
/// from this type.
#[derive(Deserialize, JsonSchema, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolArguments {
    /// Per-dimension updates keyed by S, C, O, P, E.
    pub dimensions: Option<BTreeMap<String, DimensionUpdate>>,
    pub new_evidence: Option<EvidenceArgs>,
    pub contradiction: Option<ContradictionArgs>,
    /// Narrative stream targeted by `fragment` and `quantumStates`.
    pub stream_id: Option<String>,
    pub stream_name: Option<String>,
    pub fragment: Option<FragmentArgs>,
    pub quantum_states: Option<Vec<QuantumState>>,
    pub temporal_layer: Option<TemporalLayer>,
    pub grand_narrative: Option<GrandNarrative>,
    pub yama_resonance: Option<YamaResonance>,
    pub phase: Option<ConversationPhase>,
    pub is_complete: Option<bool>,
    pub summary: Option<String>,
    pub strengths: Option<Vec<String>>,
    pub development_priorities: Option<Vec<String>>,
    /// Set only by the secondary assessor; not part of the advertised schema.
    #[serde(rename = "_inference")]
    #[schemars(skip)]
    pub inference: Option<InferenceProvenance>,
}

// --- Validated Shape ---

/// Updates aimed at one narrative stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamUpdate {
    pub stream_id: String,
    pub stream_name: Option<String>,
    pub fragment: Option<FragmentArgs>,
    pub quantum_states: Option<Vec<QuantumState>>,
}

/// A decoded, validated tool call ready for the reducer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallPayload {
    pub dimensions: BTreeMap<DimKey, DimensionUpdate>,
    pub new_evidence: Option<EvidenceItem>,
    pub contradiction: Option<ContradictionAlert>,
    pub stream: Option<StreamUpdate>,
    pub temporal_layer: Option<TemporalLayer>,
    pub grand_narrative: Option<GrandNarrative>,
    pub yama_resonance: Option<YamaResonance>,
    pub phase: Option<ConversationPhase>,
    pub is_complete: bool,
    pub summary: Option<String>,
    pub strengths: Option<Vec<String>>,
    pub development_priorities: Option<Vec<String>>,
    pub provenance: Option<InferenceProvenance>,
}

impl ToolCallPayload {
    /// Decodes raw tool-call arguments.
    ///
    /// A first parse failure triggers exactly one retry after stripping
    /// Markdown code fences and any prose around the JSON object.
    pub fn parse(raw: &str) -> Result<Self, PayloadDecodeError> {
        let args = match serde_json::from_str::<ToolArguments>(raw) {
            Ok(args) => args,
            Err(first_err) => {
                debug!(error = %first_err, "Tool arguments did not parse; retrying without wrapping");
                serde_json::from_str::<ToolArguments>(strip_wrapping(raw))?
            }
        };
        Self::try_from(args)
    }

    pub fn carries_dimension_data(&self) -> bool {
        !self.dimensions.is_empty()
    }
}

impl TryFrom<ToolArguments> for ToolCallPayload {
    type Error = PayloadDecodeError;

    fn try_from(args: ToolArguments) -> Result<Self, Self::Error> {
        let mut dimensions = BTreeMap::new();
        for (code, update) in args.dimensions.unwrap_or_default() {
            let Some(key) = DimKey::from_code(&code) else {
                warn!(code = %code, "Dropping update for unknown dimension");
                continue;
            };
            if let Some(score) = update.score {
                if !score.is_finite() {
                    return Err(PayloadDecodeError::Invalid(format!(
                        "score for dimension '{}' is not a finite number",
                        code
                    )));
                }
            }
            if code.trim() == key.to_string() {
                dimensions.insert(key, update);
            } else {
                warn!(code = %code, mapped = %key, "Repaired legacy dimension code");
                dimensions.entry(key).or_insert(update);
            }
        }

        let new_evidence = args
            .new_evidence
            .map(|ev| {
                Ok::<_, PayloadDecodeError>(EvidenceItem {
                    dimension: resolve_dimension(&ev.dimension, "newEvidence")?,
                    kind: ev.kind,
                    summary: ev.summary,
                    timestamp: ev.timestamp,
                })
            })
            .transpose()?;

        let contradiction = args
            .contradiction
            .map(|c| {
                Ok::<_, PayloadDecodeError>(ContradictionAlert {
                    dimension: resolve_dimension(&c.dimension, "contradiction")?,
                    early_statement: c.early_statement,
                    late_statement: c.late_statement,
                    resolution: c.resolution,
                })
            })
            .transpose()?;

        if let Some(states) = &args.quantum_states {
            if let Some(bad) = states
                .iter()
                .find(|s| !s.probability.is_finite() || s.probability < 0.0)
            {
                return Err(PayloadDecodeError::Invalid(format!(
                    "quantum state '{}' has an invalid probability",
                    bad.state
                )));
            }
        }

        let stream = match args.stream_id.filter(|id| !id.trim().is_empty()) {
            Some(stream_id) => Some(StreamUpdate {
                stream_id,
                stream_name: args.stream_name,
                fragment: args.fragment,
                quantum_states: args.quantum_states,
            }),
            None if args.fragment.is_some() || args.quantum_states.is_some() => {
                return Err(PayloadDecodeError::Invalid(
                    "`fragment` and `quantumStates` require a `streamId`".to_string(),
                ));
            }
            None => None,
        };

        Ok(Self {
            dimensions,
            new_evidence,
            contradiction,
            stream,
            temporal_layer: args.temporal_layer,
            grand_narrative: args.grand_narrative,
            yama_resonance: args.yama_resonance,
            phase: args.phase,
            is_complete: args.is_complete.unwrap_or(false),
            summary: args.summary,
            strengths: args.strengths,
            development_priorities: args.development_priorities,
            provenance: args.inference,
        })
    }
}

fn resolve_dimension(code: &str, field: &str) -> Result<DimKey, PayloadDecodeError> {
    DimKey::from_code(code).ok_or_else(|| {
        PayloadDecodeError::Invalid(format!("unknown dimension '{}' in `{}`", code, field))
    })
}

/// Removes Markdown code fences (```` ```json ... ``` ````) and any text
/// outside the outermost `{...}` of a JSON body.
pub fn strip_wrapping(raw: &str) -> &str {
    let mut body = raw.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = rest
            .strip_prefix("json")
            .or_else(|| rest.strip_prefix("JSON"))
            .unwrap_or(rest);
    }
    if let Some(rest) = body.trim_end().strip_suffix("```") {
        body = rest;
    }
    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => body.trim(),
    }
}
