//! Session Assessment Model
//!
//! This module defines `SessionState`, the single aggregate mutated by the
//! tool-call reducer, together with every value type it is built from.
//! Fragments live in one arena (`SessionState::all_fragments`) and refer to
//! each other by `FragmentIndex`, never by pointer.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Baseline score for a dimension with no evidence yet.
pub const BASELINE_SCORE: f64 = 2.5;
/// Upper bound of the dimension score scale.
pub const MAX_SCORE: f64 = 5.0;

/// The fixed set of assessed dimensions.
#[derive(
    Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum DimKey {
    /// Situation awareness.
    S,
    /// Choices recognition.
    C,
    /// Outcomes visualization.
    O,
    /// Purpose alignment.
    P,
    /// Engagement commitment.
    E,
}

impl DimKey {
    /// Every required key, in display order.
    pub const ALL: [DimKey; 5] = [DimKey::S, DimKey::C, DimKey::O, DimKey::P, DimKey::E];

    /// Resolves a dimension code, repairing codes from older assessment
    /// vocabularies the remote agent sometimes falls back to.
    pub fn from_code(code: &str) -> Option<DimKey> {
        match code.trim() {
            "S" | "HL" | "CO" => Some(DimKey::S),
            "C" | "CM" | "DT" => Some(DimKey::C),
            "O" | "DI" | "TR" => Some(DimKey::O),
            "P" | "DL" | "CA" => Some(DimKey::P),
            "E" | "PR" | "EP" => Some(DimKey::E),
            _ => None,
        }
    }
}

impl fmt::Display for DimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            DimKey::S => "S",
            DimKey::C => "C",
            DimKey::O => "O",
            DimKey::P => "P",
            DimKey::E => "E",
        };
        f.write_str(code)
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

/// Current reading of one dimension.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DimensionState {
    /// Score on the `[0, 5]` scale.
    pub score: f64,
    pub confidence: Confidence,
    pub evidence_count: u32,
    pub trend: Trend,
}

impl DimensionState {
    /// The state every dimension starts in, and the value used to pad missing keys.
    pub fn baseline() -> Self {
        Self {
            score: BASELINE_SCORE,
            confidence: Confidence::Low,
            evidence_count: 0,
            trend: Trend::Stable,
        }
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationPhase {
    #[default]
    Opening,
    Core,
    GapFilling,
    Validation,
    Closing,
}

/// One sample of every dimension score at a point in session time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScorePoint {
    /// Elapsed session time in seconds.
    pub time: f64,
    pub scores: BTreeMap<DimKey, f64>,
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceKind {
    Positive,
    Negative,
    Contextual,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceItem {
    pub dimension: DimKey,
    #[serde(rename = "type")]
    pub kind: EvidenceKind,
    pub summary: String,
    /// Conversation clock label, e.g. `"03:15"`.
    pub timestamp: String,
}

impl EvidenceItem {
    /// Two evidence items are the same observation when this triple matches.
    pub fn same_observation(&self, other: &EvidenceItem) -> bool {
        self.dimension == other.dimension
            && self.summary == other.summary
            && self.timestamp == other.timestamp
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContradictionAlert {
    pub dimension: DimKey,
    pub early_statement: String,
    pub late_statement: String,
    pub resolution: String,
}

/// Index of a fragment inside `SessionState::all_fragments`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct FragmentIndex(pub usize);

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Positive,
    Negative,
    Mixed,
    Neutral,
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Energy {
    Low,
    Medium,
    High,
}

/// An immutable piece of narrative evidence.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub index: FragmentIndex,
    /// Identifier assigned by the remote agent.
    pub id: String,
    pub stream_id: String,
    pub text: String,
    pub tone: Tone,
    pub energy: Energy,
    /// Turn during which the fragment was captured.
    pub turn: u32,
    /// Earlier fragments this one is linked to.
    pub entangled_with: Vec<FragmentIndex>,
}

impl Fragment {
    /// Vivid fragments carry a non-neutral tone and more than low energy.
    pub fn is_vivid(&self) -> bool {
        self.tone != Tone::Neutral && self.energy != Energy::Low
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
pub struct QuantumState {
    pub state: String,
    pub probability: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeStream {
    pub id: String,
    pub name: Option<String>,
    pub fragments: Vec<FragmentIndex>,
    pub possible_states: Vec<QuantumState>,
    pub coherence: f64,
    pub fluidity: f64,
    pub authenticity: f64,
}

impl NarrativeStream {
    pub fn new(id: String, name: Option<String>) -> Self {
        Self {
            id,
            name,
            fragments: Vec::new(),
            possible_states: Vec::new(),
            coherence: 0.0,
            fluidity: 1.0,
            authenticity: 0.5,
        }
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TemporalHorizon {
    Past,
    Present,
    Future,
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemporalLayer {
    pub horizon: TemporalHorizon,
    pub description: String,
    #[serde(default)]
    pub fragment_id: Option<String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Accepting,
    Resisting,
    Negotiating,
    Transforming,
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
pub struct GrandNarrative {
    pub discourse: String,
    pub stance: Stance,
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Yama {
    Ahimsa,
    Satya,
    Asteya,
    Brahmacharya,
    Aparigraha,
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Resonance {
    Harmony,
    Tension,
    Neutral,
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
pub struct YamaResonance {
    pub principle: Yama,
    pub resonance: Resonance,
    #[serde(default)]
    pub note: Option<String>,
}

/// Where a secondary-inference update came from. Attached by the sidecar and
/// kept so the review pipeline can tell those updates from the agent's.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceProvenance {
    pub source: String,
    pub model: String,
    /// RFC 3339 UTC time the update was produced.
    pub timestamp: String,
    pub call_id: String,
    /// First 16 hex digits of the SHA-256 of the update body.
    pub data_hash: String,
}

/// The canonical assessment aggregate for one session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub dimensions: BTreeMap<DimKey, DimensionState>,
    pub score_history: Vec<ScorePoint>,
    pub evidence_log: Vec<EvidenceItem>,
    pub contradictions: Vec<ContradictionAlert>,
    pub conversation_phase: ConversationPhase,
    pub narrative_streams: BTreeMap<String, NarrativeStream>,
    pub all_fragments: Vec<Fragment>,
    pub temporal_layers: Vec<TemporalLayer>,
    pub grand_narratives: Vec<GrandNarrative>,
    pub yama_resonances: Vec<YamaResonance>,
    pub turn_count: u32,
    pub is_complete: bool,
    pub summary: Option<String>,
    pub strengths: Vec<String>,
    pub development_priorities: Vec<String>,
    /// One entry per applied secondary-inference update, in arrival order.
    #[serde(default)]
    pub inference_log: Vec<InferenceProvenance>,
}

impl SessionState {
    /// A fresh session with every dimension at baseline.
    pub fn new() -> Self {
        Self {
            dimensions: DimKey::ALL
                .iter()
                .map(|k| (*k, DimensionState::baseline()))
                .collect(),
            score_history: Vec::new(),
            evidence_log: Vec::new(),
            contradictions: Vec::new(),
            conversation_phase: ConversationPhase::default(),
            narrative_streams: BTreeMap::new(),
            all_fragments: Vec::new(),
            temporal_layers: Vec::new(),
            grand_narratives: Vec::new(),
            yama_resonances: Vec::new(),
            turn_count: 0,
            is_complete: false,
            summary: None,
            strengths: Vec::new(),
            development_priorities: Vec::new(),
            inference_log: Vec::new(),
        }
    }

    /// Finds a fragment in the arena by the identifier the agent gave it.
    pub fn fragment_by_id(&self, id: &str) -> Option<&Fragment> {
        self.all_fragments.iter().find(|f| f.id == id)
    }

    /// True once every required dimension is held with high confidence.
    pub fn all_dimensions_confident(&self) -> bool {
        DimKey::ALL.iter().all(|k| {
            self.dimensions
                .get(k)
                .is_some_and(|d| d.confidence == Confidence::High)
        })
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
