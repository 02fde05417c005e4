//! Review Collaborator Boundary
//!
//! The engine hands a finished session to an external review pipeline through
//! a single call, `finalize`. What happens on the other side (harm screening,
//! human review, report delivery) is opaque; the engine only learns whether
//! the results went straight out or are waiting on a reviewer.

use crate::model::{
    ContradictionAlert, ConversationPhase, DimKey, DimensionState, EvidenceItem, Fragment,
    GrandNarrative, InferenceProvenance, NarrativeStream, ScorePoint, SessionState,
    TemporalLayer, YamaResonance,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// The projection of `SessionState` sent to the review pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinalizePayload {
    pub destination: String,
    pub dimensions: BTreeMap<DimKey, DimensionState>,
    pub score_history: Vec<ScorePoint>,
    pub evidence_log: Vec<EvidenceItem>,
    pub contradictions: Vec<ContradictionAlert>,
    pub narrative_streams: BTreeMap<String, NarrativeStream>,
    pub fragments: Vec<Fragment>,
    pub conversation_phase: ConversationPhase,
    pub temporal_layers: Vec<TemporalLayer>,
    pub grand_narratives: Vec<GrandNarrative>,
    pub yama_resonances: Vec<YamaResonance>,
    pub turn_count: u32,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub summary: Option<String>,
    pub strengths: Vec<String>,
    pub development_priorities: Vec<String>,
    /// Provenance of every secondary-inference update that shaped the result.
    #[serde(default)]
    pub inference_log: Vec<InferenceProvenance>,
}

impl FinalizePayload {
    pub fn project(state: &SessionState, destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            dimensions: state.dimensions.clone(),
            score_history: state.score_history.clone(),
            evidence_log: state.evidence_log.clone(),
            contradictions: state.contradictions.clone(),
            narrative_streams: state.narrative_streams.clone(),
            fragments: state.all_fragments.clone(),
            conversation_phase: state.conversation_phase,
            temporal_layers: state.temporal_layers.clone(),
            grand_narratives: state.grand_narratives.clone(),
            yama_resonances: state.yama_resonances.clone(),
            turn_count: state.turn_count,
            is_complete: state.is_complete,
            summary: state.summary.clone(),
            strengths: state.strengths.clone(),
            development_priorities: state.development_priorities.clone(),
            inference_log: state.inference_log.clone(),
        }
    }
}

/// What the review pipeline did with a finalized session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    Delivered {
        #[serde(rename = "reviewId", skip_serializing_if = "Option::is_none", default)]
        review_id: Option<String>,
    },
    PendingReview {
        #[serde(rename = "reviewId")]
        review_id: String,
        message: String,
    },
}

/// Defines the contract for the external review pipeline.
///
/// Implementations may deliver results directly or hold them for a human
/// reviewer. Either way the engine treats the call as the end of the session.
#[async_trait]
pub trait ReviewCollaborator: Send + Sync {
    /// Submits a finished session.
    ///
    /// # Arguments
    ///
    /// * `payload` - The session projection plus the destination it is meant for.
    ///
    /// # Returns
    ///
    /// The pipeline's decision, or an error if it could not be reached.
    async fn finalize(&self, payload: &FinalizePayload) -> Result<FinalizeOutcome>;
}

/// Posts the payload as JSON to an HTTP endpoint and reads back the outcome.
pub struct HttpReviewCollaborator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReviewCollaborator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ReviewCollaborator for HttpReviewCollaborator {
    async fn finalize(&self, payload: &FinalizePayload) -> Result<FinalizeOutcome> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Failed to reach review endpoint {}", self.endpoint))?
            .error_for_status()
            .context("Review endpoint rejected the session")?;

        let outcome = response
            .json::<FinalizeOutcome>()
            .await
            .context("Review endpoint returned an unexpected body")?;
        info!(?outcome, "Session handed to review pipeline");
        Ok(outcome)
    }
}

/// Reports every session as delivered without sending it anywhere.
///
/// Used when no review endpoint is configured, e.g. in local development.
pub struct LoopbackReviewCollaborator;

#[async_trait]
impl ReviewCollaborator for LoopbackReviewCollaborator {
    async fn finalize(&self, payload: &FinalizePayload) -> Result<FinalizeOutcome> {
        info!(
            destination = %payload.destination,
            turn_count = payload.turn_count,
            "Loopback review: marking session delivered"
        );
        Ok(FinalizeOutcome::Delivered { review_id: None })
    }
}
