//! Tool-Call Reducer
//!
//! `apply` is the pure transform `(state, payload) -> state`. `ReducerActor`
//! owns the canonical `SessionState` and applies queued tool calls strictly one
//! at a time in arrival order, so two calls arriving back to back never merge
//! against the same stale snapshot.

use crate::model::{
    DimKey, DimensionState, Fragment, FragmentIndex, MAX_SCORE, NarrativeStream, QuantumState,
    ScorePoint, SessionState,
};
use crate::payload::{PayloadDecodeError, StreamUpdate, ToolCallPayload};
use crate::sidecar::is_sidecar_call;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Applies one validated payload to `state`, returning the next state.
///
/// `elapsed` is the session time at which the call was received; it stamps the
/// score-history point appended by this step.
pub fn apply(mut state: SessionState, payload: &ToolCallPayload, elapsed: Duration) -> SessionState {
    // Steps 1-4: narrative stream, fragments, probabilities, derived qualities.
    let touched = payload
        .stream
        .as_ref()
        .map(|update| apply_stream_update(&mut state, update));

    if let Some(layer) = &payload.temporal_layer {
        state.temporal_layers.push(layer.clone());
    }
    if let Some(narrative) = &payload.grand_narrative {
        state.grand_narratives.push(narrative.clone());
    }
    if let Some(resonance) = &payload.yama_resonance {
        state.yama_resonances.push(resonance.clone());
    }

    if let Some(stream_id) = touched {
        recompute_qualities(&mut state, &stream_id);
    }

    // Step 5
    if let Some(phase) = payload.phase {
        state.conversation_phase = phase;
    }

    // Step 6
    if payload.carries_dimension_data() {
        state.turn_count += 1;
    }

    // Step 7: merge, then pad every missing key back to baseline.
    for (key, update) in &payload.dimensions {
        let dim = state
            .dimensions
            .entry(*key)
            .or_insert_with(DimensionState::baseline);
        if let Some(score) = update.score {
            dim.score = score.clamp(0.0, MAX_SCORE);
        }
        if let Some(confidence) = update.confidence {
            dim.confidence = confidence;
        }
        if let Some(count) = update.evidence_count {
            dim.evidence_count = count;
        }
        if let Some(trend) = update.trend {
            dim.trend = trend;
        }
    }
    for key in DimKey::ALL {
        state
            .dimensions
            .entry(key)
            .or_insert_with(DimensionState::baseline);
    }

    // Step 8: score history stays non-decreasing in time.
    let last_time = state.score_history.last().map_or(0.0, |p| p.time);
    state.score_history.push(ScorePoint {
        time: elapsed.as_secs_f64().max(last_time),
        scores: state
            .dimensions
            .iter()
            .map(|(key, dim)| (*key, dim.score))
            .collect(),
    });

    // Step 9
    if let Some(evidence) = &payload.new_evidence {
        if state
            .evidence_log
            .iter()
            .any(|existing| existing.same_observation(evidence))
        {
            debug!(dimension = %evidence.dimension, "Skipping duplicate evidence");
        } else {
            state.evidence_log.push(evidence.clone());
        }
    }
    if let Some(contradiction) = &payload.contradiction {
        state.contradictions.push(contradiction.clone());
    }
    if let Some(summary) = &payload.summary {
        state.summary = Some(summary.clone());
    }
    if let Some(strengths) = &payload.strengths {
        state.strengths = strengths.clone();
    }
    if let Some(priorities) = &payload.development_priorities {
        state.development_priorities = priorities.clone();
    }
    if let Some(provenance) = &payload.provenance {
        state.inference_log.push(provenance.clone());
    }

    // Step 10
    if payload.is_complete {
        state.is_complete = true;
    }

    state
}

fn apply_stream_update(state: &mut SessionState, update: &StreamUpdate) -> String {
    let stream_id = update.stream_id.clone();
    if !state.narrative_streams.contains_key(&stream_id) {
        state.narrative_streams.insert(
            stream_id.clone(),
            NarrativeStream::new(stream_id.clone(), update.stream_name.clone()),
        );
    }

    if let Some(args) = &update.fragment {
        let entangled_with: Vec<FragmentIndex> = args
            .entangled_with
            .iter()
            .filter_map(|id| {
                let found = state.fragment_by_id(id).map(|f| f.index);
                if found.is_none() {
                    warn!(fragment = %args.id, target = %id, "Ignoring link to unknown fragment");
                }
                found
            })
            .collect();
        let index = FragmentIndex(state.all_fragments.len());
        state.all_fragments.push(Fragment {
            index,
            id: args.id.clone(),
            stream_id: stream_id.clone(),
            text: args.text.clone(),
            tone: args.tone,
            energy: args.energy,
            turn: state.turn_count,
            entangled_with,
        });
        if let Some(stream) = state.narrative_streams.get_mut(&stream_id) {
            stream.fragments.push(index);
        }
    }

    if let Some(states) = &update.quantum_states {
        if let Some(stream) = state.narrative_streams.get_mut(&stream_id) {
            stream.possible_states = normalize(states);
        }
    }

    if let (Some(name), Some(stream)) = (
        &update.stream_name,
        state.narrative_streams.get_mut(&stream_id),
    ) {
        stream.name = Some(name.clone());
    }

    stream_id
}

/// Rescales probabilities to sum to one.
///
/// An all-zero set has no mass to rescale and becomes a uniform distribution.
pub fn normalize(states: &[QuantumState]) -> Vec<QuantumState> {
    let total: f64 = states.iter().map(|s| s.probability).sum();
    let uniform = 1.0 / states.len().max(1) as f64;
    states
        .iter()
        .map(|s| QuantumState {
            state: s.state.clone(),
            probability: if total > 0.0 {
                s.probability / total
            } else {
                uniform
            },
        })
        .collect()
}

fn recompute_qualities(state: &mut SessionState, stream_id: &str) {
    let Some(stream) = state.narrative_streams.get(stream_id) else {
        return;
    };
    let fragments: Vec<&Fragment> = stream
        .fragments
        .iter()
        .filter_map(|idx| state.all_fragments.get(idx.0))
        .collect();
    let coherence = coherence(&fragments);
    let authenticity = authenticity(&fragments);
    let fluidity = fluidity(&stream.possible_states);

    if let Some(stream) = state.narrative_streams.get_mut(stream_id) {
        stream.coherence = coherence;
        stream.fluidity = fluidity;
        stream.authenticity = authenticity;
    }
}

/// Share of possible entanglement links actually present, capped at one.
pub fn coherence(fragments: &[&Fragment]) -> f64 {
    if fragments.is_empty() {
        return 0.0;
    }
    let links: usize = fragments.iter().map(|f| f.entangled_with.len()).sum();
    (links as f64 / (fragments.len() * 2) as f64).min(1.0)
}

/// How far the most likely state is from certainty; one means evenly spread.
pub fn fluidity(states: &[QuantumState]) -> f64 {
    match states.len() {
        0 => 1.0,
        1 => 0.5,
        n => {
            let even = 1.0 / n as f64;
            let max = states
                .iter()
                .map(|s| s.probability)
                .fold(f64::MIN, f64::max);
            (1.0 - (max - even) / (1.0 - even)).clamp(0.0, 1.0)
        }
    }
}

/// Share of vivid fragments; 0.5 while the stream has none.
pub fn authenticity(fragments: &[&Fragment]) -> f64 {
    if fragments.is_empty() {
        return 0.5;
    }
    let vivid = fragments.iter().filter(|f| f.is_vivid()).count();
    vivid as f64 / fragments.len() as f64
}

// --- Actor ---

/// Events published by the reducer actor.
#[derive(Debug, Clone)]
pub enum ReducerEvent {
    /// A payload was applied; carries the resulting state.
    StateUpdated(Arc<SessionState>),
    /// A payload was dropped. The queue keeps going.
    Diagnostic { call_id: String, message: String },
    /// The applied payload marked the session complete.
    CompletionRequested,
}

enum ReducerMsg {
    Apply {
        call_id: String,
        arguments: String,
        elapsed: Duration,
    },
    Snapshot(oneshot::Sender<SessionState>),
}

/// Cheap handle to a running `ReducerActor`.
#[derive(Clone)]
pub struct ReducerHandle {
    tx: mpsc::UnboundedSender<ReducerMsg>,
}

impl ReducerHandle {
    /// Queues raw tool-call arguments. Never blocks the caller.
    pub fn submit(&self, call_id: impl Into<String>, arguments: impl Into<String>, elapsed: Duration) {
        let msg = ReducerMsg::Apply {
            call_id: call_id.into(),
            arguments: arguments.into(),
            elapsed,
        };
        if self.tx.send(msg).is_err() {
            warn!("Reducer is gone; dropping tool call.");
        }
    }

    /// Returns the state after every previously queued call has been applied.
    pub async fn snapshot(&self) -> Option<SessionState> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ReducerMsg::Snapshot(tx)).ok()?;
        rx.await.ok()
    }
}

/// Single-writer owner of `SessionState`.
pub struct ReducerActor {
    state: SessionState,
    rx: mpsc::UnboundedReceiver<ReducerMsg>,
    events: mpsc::UnboundedSender<ReducerEvent>,
}

impl ReducerActor {
    /// Spawns the actor on the current runtime with a fresh state.
    ///
    /// The actor runs until every `ReducerHandle` is dropped.
    pub fn spawn() -> (ReducerHandle, mpsc::UnboundedReceiver<ReducerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let actor = ReducerActor {
            state: SessionState::new(),
            rx,
            events,
        };
        tokio::spawn(actor.run());
        (ReducerHandle { tx }, events_rx)
    }

    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                ReducerMsg::Apply {
                    call_id,
                    arguments,
                    elapsed,
                } => self.handle_apply(call_id, &arguments, elapsed),
                ReducerMsg::Snapshot(reply) => {
                    if reply.send(self.state.clone()).is_err() {
                        debug!("Snapshot requester went away");
                    }
                }
            }
        }
        debug!("Reducer mailbox closed");
    }

    fn handle_apply(&mut self, call_id: String, arguments: &str, elapsed: Duration) {
        let mut payload = match ToolCallPayload::parse(arguments) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Dropping malformed tool call");
                let message = match &e {
                    PayloadDecodeError::Json(_) => format!("Malformed assessment update dropped: {}", e),
                    PayloadDecodeError::Invalid(_) => format!("Invalid assessment update dropped: {}", e),
                };
                self.publish(ReducerEvent::Diagnostic { call_id, message });
                return;
            }
        };

        // Provenance is only believed on the sidecar's own calls.
        if payload
            .provenance
            .as_ref()
            .is_some_and(|p| !is_sidecar_call(&call_id) || p.call_id != call_id)
        {
            warn!(call_id = %call_id, "Ignoring inference provenance on a foreign call");
            payload.provenance = None;
        }

        let was_complete = self.state.is_complete;
        let state = std::mem::take(&mut self.state);
        self.state = apply(state, &payload, elapsed);
        info!(
            call_id = %call_id,
            turn_count = self.state.turn_count,
            phase = ?self.state.conversation_phase,
            "Applied assessment update"
        );
        self.publish(ReducerEvent::StateUpdated(Arc::new(self.state.clone())));

        if payload.is_complete && !was_complete {
            self.publish(ReducerEvent::CompletionRequested);
        }
    }

    fn publish(&self, event: ReducerEvent) {
        if self.events.send(event).is_err() {
            debug!("No reducer event listener");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Confidence, ConversationPhase, Energy, Tone, Trend};
    use approx::assert_abs_diff_eq;

    fn parse(raw: &str) -> ToolCallPayload {
        ToolCallPayload::parse(raw).expect("test payload should parse")
    }

    fn fragment_payload(id: &str, links: &[&str], tone: &str, energy: &str) -> ToolCallPayload {
        let links = serde_json::to_string(links).unwrap();
        parse(&format!(
            r#"{{"streamId":"work","fragment":{{"id":"{id}","text":"t","tone":"{tone}","energy":"{energy}","entangledWith":{links}}}}}"#
        ))
    }

    #[test]
    fn test_first_payload_touches_only_named_dimension() {
        let state = apply(
            SessionState::new(),
            &parse(r#"{"dimensions":{"S":{"score":4}},"phase":"CORE"}"#),
            Duration::from_secs(12),
        );
        assert_eq!(state.dimensions[&DimKey::S].score, 4.0);
        for key in [DimKey::C, DimKey::O, DimKey::P, DimKey::E] {
            assert_eq!(state.dimensions[&key].score, 2.5);
            assert_eq!(state.dimensions[&key].confidence, Confidence::Low);
        }
        assert_eq!(state.conversation_phase, ConversationPhase::Core);
        assert_eq!(state.turn_count, 1);
        assert_eq!(state.score_history.len(), 1);
        assert_eq!(state.score_history[0].scores[&DimKey::S], 4.0);
        assert_eq!(state.score_history[0].scores.len(), 5);
    }

    #[test]
    fn test_dimension_keys_survive_any_sequence() {
        let payloads = [
            r#"{"dimensions":{"S":{"score":3}}}"#,
            r#"{"phase":"GAP_FILLING"}"#,
            r#"{"dimensions":{"HL":{"confidence":"HIGH"},"XX":{"score":1}}}"#,
            r#"{"dimensions":{}}"#,
        ];
        let mut state = SessionState::new();
        state.dimensions.clear();
        for (i, raw) in payloads.iter().enumerate() {
            state = apply(state, &parse(raw), Duration::from_secs(i as u64));
            let keys: Vec<DimKey> = state.dimensions.keys().copied().collect();
            assert_eq!(keys, DimKey::ALL.to_vec());
        }
        assert_eq!(state.dimensions[&DimKey::S].confidence, Confidence::High);
        assert_eq!(state.turn_count, 2);
    }

    #[test]
    fn test_partial_dimension_update_keeps_other_fields() {
        let state = apply(
            SessionState::new(),
            &parse(r#"{"dimensions":{"P":{"score":3.2,"confidence":"MEDIUM","trend":"up","evidenceCount":2}}}"#),
            Duration::ZERO,
        );
        let state = apply(state, &parse(r#"{"dimensions":{"P":{"score":3.6}}}"#), Duration::ZERO);
        let p = state.dimensions[&DimKey::P];
        assert_eq!(p.score, 3.6);
        assert_eq!(p.confidence, Confidence::Medium);
        assert_eq!(p.trend, Trend::Up);
        assert_eq!(p.evidence_count, 2);
    }

    #[test]
    fn test_scores_are_clamped() {
        let state = apply(
            SessionState::new(),
            &parse(r#"{"dimensions":{"S":{"score":7.5},"C":{"score":-1}}}"#),
            Duration::ZERO,
        );
        assert_eq!(state.dimensions[&DimKey::S].score, 5.0);
        assert_eq!(state.dimensions[&DimKey::C].score, 0.0);
    }

    #[test]
    fn test_zero_probabilities_become_uniform() {
        let state = apply(
            SessionState::new(),
            &parse(r#"{"streamId":"s","quantumStates":[{"state":"A","probability":0},{"state":"B","probability":0}]}"#),
            Duration::ZERO,
        );
        let probs: Vec<f64> = state.narrative_streams["s"]
            .possible_states
            .iter()
            .map(|s| s.probability)
            .collect();
        assert_eq!(probs, vec![0.5, 0.5]);
        assert_abs_diff_eq!(state.narrative_streams["s"].fluidity, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_probabilities_are_normalized() {
        let state = apply(
            SessionState::new(),
            &parse(r#"{"streamId":"s","quantumStates":[{"state":"A","probability":3},{"state":"B","probability":1},{"state":"C","probability":0.5}]}"#),
            Duration::ZERO,
        );
        let stream = &state.narrative_streams["s"];
        let total: f64 = stream.possible_states.iter().map(|s| s.probability).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(stream.possible_states[0].probability, 3.0 / 4.5, epsilon = 1e-9);
        // max = 2/3, even = 1/3 -> 1 - (1/3)/(2/3) = 0.5
        assert_abs_diff_eq!(stream.fluidity, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_duplicate_evidence_is_kept_once() {
        let raw = r#"{"newEvidence":{"dimension":"C","type":"positive","summary":"Listed three options","timestamp":"02:10"}}"#;
        let mut state = SessionState::new();
        state = apply(state, &parse(raw), Duration::from_secs(1));
        state = apply(state, &parse(raw), Duration::from_secs(2));
        assert_eq!(state.evidence_log.len(), 1);

        let other_time = raw.replace("02:10", "02:40");
        state = apply(state, &parse(&other_time), Duration::from_secs(3));
        assert_eq!(state.evidence_log.len(), 2);
    }

    #[test]
    fn test_score_history_time_never_decreases() {
        let mut state = SessionState::new();
        for secs in [5, 9, 3, 12, 12, 1] {
            state = apply(state, &parse(r#"{"dimensions":{"E":{"score":3}}}"#), Duration::from_secs(secs));
        }
        assert_eq!(state.score_history.len(), 6);
        for pair in state.score_history.windows(2) {
            assert!(pair[0].time <= pair[1].time);
        }
    }

    #[test]
    fn test_fragments_link_by_index_and_qualities_follow() {
        let mut state = SessionState::new();
        state = apply(state, &fragment_payload("f1", &[], "positive", "high"), Duration::ZERO);
        state = apply(state, &fragment_payload("f2", &["f1", "missing"], "neutral", "medium"), Duration::ZERO);

        assert_eq!(state.all_fragments.len(), 2);
        assert_eq!(state.all_fragments[1].entangled_with, vec![FragmentIndex(0)]);
        let stream = &state.narrative_streams["work"];
        assert_eq!(stream.fragments, vec![FragmentIndex(0), FragmentIndex(1)]);
        // one link over 2 fragments * 2
        assert_abs_diff_eq!(stream.coherence, 0.25, epsilon = 1e-9);
        // f1 vivid, f2 neutral
        assert_abs_diff_eq!(stream.authenticity, 0.5, epsilon = 1e-9);
        assert_eq!(state.all_fragments[1].tone, Tone::Neutral);
        assert_eq!(state.all_fragments[0].energy, Energy::High);
    }

    #[test]
    fn test_completion_and_narrative_entries() {
        let state = apply(
            SessionState::new(),
            &parse(
                r#"{"isComplete":true,
                    "temporalLayer":{"horizon":"future","description":"Leading the team"},
                    "grandNarrative":{"discourse":"Hustle culture","stance":"resisting"},
                    "yamaResonance":{"principle":"satya","resonance":"harmony"},
                    "contradiction":{"dimension":"P","earlyStatement":"a","lateStatement":"b","resolution":"c"},
                    "summary":"Ready","strengths":["Clarity"]}"#,
            ),
            Duration::ZERO,
        );
        assert!(state.is_complete);
        assert_eq!(state.temporal_layers.len(), 1);
        assert_eq!(state.grand_narratives.len(), 1);
        assert_eq!(state.yama_resonances.len(), 1);
        assert_eq!(state.contradictions.len(), 1);
        assert_eq!(state.summary.as_deref(), Some("Ready"));
        assert_eq!(state.strengths, vec!["Clarity".to_string()]);
        assert_eq!(state.turn_count, 0);
    }

    #[test]
    fn test_fluidity_edge_cases() {
        assert_eq!(fluidity(&[]), 1.0);
        let single = [QuantumState { state: "A".into(), probability: 1.0 }];
        assert_eq!(fluidity(&single), 0.5);
        let certain = [
            QuantumState { state: "A".into(), probability: 1.0 },
            QuantumState { state: "B".into(), probability: 0.0 },
        ];
        assert_abs_diff_eq!(fluidity(&certain), 0.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_back_to_back_fragments_are_not_lost() {
        let (handle, mut events) = ReducerActor::spawn();
        handle.submit(
            "call_1",
            r#"{"streamId":"work","fragment":{"id":"a","text":"one","tone":"mixed","energy":"medium"}}"#,
            Duration::from_secs(1),
        );
        handle.submit(
            "call_2",
            r#"{"streamId":"work","fragment":{"id":"b","text":"two","tone":"negative","energy":"high"}}"#,
            Duration::from_secs(1),
        );

        let state = handle.snapshot().await.expect("actor alive");
        assert_eq!(state.narrative_streams["work"].fragments.len(), 2);
        assert_eq!(state.all_fragments.len(), 2);

        let mut updates = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ReducerEvent::StateUpdated(_)) {
                updates += 1;
            }
        }
        assert_eq!(updates, 2);
    }

    #[tokio::test]
    async fn test_malformed_call_does_not_stall_queue() {
        let (handle, mut events) = ReducerActor::spawn();
        handle.submit("bad", "{\"dimensions\": oops", Duration::ZERO);
        handle.submit("good", r#"{"dimensions":{"C":{"score":3.5}}}"#, Duration::ZERO);

        let state = handle.snapshot().await.unwrap();
        assert_eq!(state.dimensions[&DimKey::C].score, 3.5);
        assert_eq!(state.turn_count, 1);

        match events.recv().await {
            Some(ReducerEvent::Diagnostic { call_id, .. }) => assert_eq!(call_id, "bad"),
            other => panic!("expected diagnostic first, got {:?}", other),
        }
        assert!(matches!(events.recv().await, Some(ReducerEvent::StateUpdated(_))));
    }

    #[tokio::test]
    async fn test_completion_requested_once() {
        let (handle, mut events) = ReducerActor::spawn();
        handle.submit("c1", r#"{"isComplete":true}"#, Duration::ZERO);
        handle.submit("c2", r#"{"isComplete":true}"#, Duration::ZERO);
        let state = handle.snapshot().await.unwrap();
        assert!(state.is_complete);

        let mut completions = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ReducerEvent::CompletionRequested) {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_provenance_is_logged_only_for_sidecar_calls() {
        let (handle, _events) = ReducerActor::spawn();
        let body = |call_id: &str| {
            format!(
                r#"{{"dimensions":{{"P":{{"score":3}}}},"_inference":{{"source":"sidecar","model":"m","timestamp":"2026-01-01T00:00:00Z","callId":"{call_id}","dataHash":"abcd"}}}}"#
            )
        };
        handle.submit("sidecar_7", body("sidecar_7"), Duration::ZERO);
        handle.submit("call_agent", body("call_agent"), Duration::ZERO);
        handle.submit("sidecar_8", body("sidecar_9"), Duration::ZERO);

        let state = handle.snapshot().await.unwrap();
        assert_eq!(state.turn_count, 3);
        assert_eq!(state.inference_log.len(), 1);
        assert_eq!(state.inference_log[0].call_id, "sidecar_7");
    }
}
