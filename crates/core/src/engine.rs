//! Real-Time Session Engine
//!
//! One `SessionEngine` drives one coaching session. It is the single owner of
//! the turn-taking machine, the capture pipeline, the playback scheduler and
//! the lifecycle controller, and it talks to the reducer actor only through
//! its mailbox. Everything reaches it as a message: microphone frames and UI
//! commands from the host, protocol events from the transport, results from
//! the secondary inference task, and state updates from the reducer. A fixed
//! tick drives playback retirement, cooldown expiry and the session timers.
//!
//! Barge-in stops playback and flips turn state immediately but never touches
//! the reducer queue, so evidence that was already captured is still merged.

use crate::audio::{self, AudioFrame};
use crate::capture::{CaptureConfig, CaptureError, CapturePipeline, InputLevel, InputStream};
use crate::collaborator::{FinalizeOutcome, ReviewCollaborator};
use crate::lifecycle::{
    ConnectionState, LifecycleConfig, LifecycleError, LifecycleSignal, SessionLifecycle,
};
use crate::model::SessionState;
use crate::playback::{
    AudioSink, PlaybackEvent, PlaybackHandle, PlaybackScheduler, StreamClock,
};
use crate::protocol::{ASSESSMENT_TOOL_NAME, InboundEvent, OutboundEvent, SessionConfig};
use crate::reducer::{ReducerActor, ReducerEvent, ReducerHandle};
use crate::sidecar::{self, AssessmentInference, Speaker, TranscriptTurn};
use crate::transport::{Transport, TransportError};
use crate::turn_taking::{TurnPhase, TurnTaking};
use serde_json::json;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cooldown: Duration,
    pub grace: Duration,
    pub hard_cutoff: Duration,
    pub early_exit_after: Duration,
    pub tick_interval: Duration,
    pub capture: CaptureConfig,
    pub instructions: String,
    pub voice: String,
    /// Where results go when the session is finalized without an explicit destination.
    pub destination: Option<String>,
    pub tool_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown: crate::turn_taking::DEFAULT_COOLDOWN,
            grace: crate::playback::DEFAULT_GRACE,
            hard_cutoff: crate::lifecycle::DEFAULT_HARD_CUTOFF,
            early_exit_after: crate::lifecycle::DEFAULT_EARLY_EXIT_AFTER,
            tick_interval: Duration::from_millis(20),
            capture: CaptureConfig::default(),
            instructions: String::new(),
            voice: "alloy".to_string(),
            destination: None,
            tool_name: ASSESSMENT_TOOL_NAME.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Requests from the host (browser connection, CLI, test).
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Raw microphone samples at the input stream's rate.
    MicFrame(Vec<f32>),
    SetMuted(bool),
    Pause,
    Resume,
    Finalize { destination: String },
    Shutdown,
}

/// Everything the host may want to render or forward.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Lifecycle(ConnectionState),
    StateUpdated(Arc<SessionState>),
    AudioChunk {
        handle: PlaybackHandle,
        start_at: f64,
        data: String,
    },
    Interrupt { handles: Vec<PlaybackHandle> },
    InputLevel { level: InputLevel, echo_likelihood: f32 },
    Turn(TurnPhase),
    EarlyExitAvailable,
    CutoffReached,
    Finalized(FinalizeOutcome),
    Diagnostic(String),
    Error(String),
}

/// Forwards scheduled audio to the host as `AudioChunk` events.
///
/// The host plays each chunk at its `start_at` and drops everything named in
/// the `Interrupt` event that follows a barge-in, so `stop` has nothing left to do.
pub struct ChannelSink {
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl AudioSink for ChannelSink {
    fn play(&mut self, handle: PlaybackHandle, frame: &AudioFrame, start_at: f64) {
        let event = EngineEvent::AudioChunk {
            handle,
            start_at,
            data: audio::encode_pcm16(&frame.samples),
        };
        if self.events.send(event).is_err() {
            debug!(handle, "Host gone; audio chunk not delivered");
        }
    }

    fn stop(&mut self, handle: PlaybackHandle) {
        trace!(handle, "Playback handle stopped");
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn next_inbound(transport: &mut Option<Transport>) -> Option<InboundEvent> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_reducer_event(
    events: &mut Option<mpsc::UnboundedReceiver<ReducerEvent>>,
) -> Option<ReducerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

pub struct SessionEngine {
    config: EngineConfig,
    lifecycle: SessionLifecycle,
    turn: TurnTaking,
    capture: CapturePipeline,
    playback: PlaybackScheduler<StreamClock, ChannelSink>,
    reducer: Option<ReducerHandle>,
    reducer_events: Option<mpsc::UnboundedReceiver<ReducerEvent>>,
    latest: Arc<SessionState>,
    transport: Option<Transport>,
    collaborator: Arc<dyn ReviewCollaborator>,
    assessor: Option<Arc<dyn AssessmentInference>>,
    history: Vec<TranscriptTurn>,
    inference_tasks: JoinSet<()>,
    injected_tx: mpsc::UnboundedSender<InboundEvent>,
    injected_rx: mpsc::UnboundedReceiver<InboundEvent>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl SessionEngine {
    pub fn new(
        config: EngineConfig,
        collaborator: Arc<dyn ReviewCollaborator>,
        assessor: Option<Arc<dyn AssessmentInference>>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let (injected_tx, injected_rx) = mpsc::unbounded_channel();
        Self {
            lifecycle: SessionLifecycle::new(LifecycleConfig {
                hard_cutoff: config.hard_cutoff,
                early_exit_after: config.early_exit_after,
            }),
            turn: TurnTaking::new(config.cooldown),
            capture: CapturePipeline::new(config.capture),
            playback: PlaybackScheduler::new(
                StreamClock::new(),
                ChannelSink {
                    events: events.clone(),
                },
                config.grace,
            ),
            reducer: None,
            reducer_events: None,
            latest: Arc::new(SessionState::new()),
            transport: None,
            collaborator,
            assessor,
            history: Vec::new(),
            inference_tasks: JoinSet::new(),
            injected_tx,
            injected_rx,
            events,
            config,
        }
    }

    pub fn lifecycle_state(&self) -> &ConnectionState {
        self.lifecycle.state()
    }

    /// Opens capture and moves to `Connecting` with a fresh `SessionState`.
    ///
    /// A denied microphone fails here and leaves no partial session behind.
    pub fn begin(&mut self, input: &InputStream) -> Result<(), EngineError> {
        self.capture.start(input)?;
        if let Err(e) = self.lifecycle.connect() {
            self.capture.stop();
            return Err(e.into());
        }

        let (reducer, reducer_events) = ReducerActor::spawn();
        self.reducer = Some(reducer);
        self.reducer_events = Some(reducer_events);
        self.latest = Arc::new(SessionState::new());
        self.turn = TurnTaking::new(self.config.cooldown);
        self.history.clear();
        self.playback = PlaybackScheduler::new(
            StreamClock::new(),
            ChannelSink {
                events: self.events.clone(),
            },
            self.config.grace,
        );
        self.emit(EngineEvent::Lifecycle(self.lifecycle.state().clone()));
        Ok(())
    }

    /// Drives the session over `transport` until it is finalized, shut down, or lost.
    pub async fn run(
        mut self,
        transport: Transport,
        mut commands: mpsc::Receiver<EngineCommand>,
    ) -> Result<(), EngineError> {
        let session = SessionConfig::new(
            self.config.instructions.clone(),
            self.config.voice.clone(),
            &self.config.tool_name,
        );
        transport.send(OutboundEvent::SessionUpdate { session })?;
        self.transport = Some(transport);
        self.lifecycle.on_connected(now())?;
        self.emit(EngineEvent::Lifecycle(self.lifecycle.state().clone()));

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let flow = tokio::select! {
                inbound = next_inbound(&mut self.transport) => match inbound {
                    Some(event) => {
                        self.handle_inbound(event);
                        ControlFlow::Continue(())
                    }
                    None => {
                        error!("Transport closed by remote");
                        self.lifecycle.fail("transport closed");
                        self.emit(EngineEvent::Lifecycle(self.lifecycle.state().clone()));
                        self.release();
                        return Err(TransportError::Closed.into());
                    }
                },
                Some(event) = self.injected_rx.recv() => {
                    self.handle_inbound(event);
                    ControlFlow::Continue(())
                }
                Some(finished) = self.inference_tasks.join_next(), if !self.inference_tasks.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!(error = %e, "Secondary assessment task panicked");
                        }
                    }
                    ControlFlow::Continue(())
                }
                event = next_reducer_event(&mut self.reducer_events) => match event {
                    Some(event) => {
                        self.handle_reducer_event(event);
                        ControlFlow::Continue(())
                    }
                    None => {
                        self.reducer_events = None;
                        ControlFlow::Continue(())
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        info!("Host closed the command channel");
                        self.shutdown();
                        ControlFlow::Break(())
                    }
                },
                _ = ticker.tick() => self.on_tick().await,
            };

            if flow.is_break() {
                return Ok(());
            }
        }
    }

    fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::ResponseAudioDelta { delta } => match self.playback.enqueue_encoded(&delta) {
                Ok(_) => {
                    if self.turn.on_agent_audio() {
                        self.emit_turn();
                    }
                }
                Err(e) => warn!(error = %e, "Dropping corrupt agent audio frame"),
            },
            InboundEvent::FunctionCallArgumentsDone {
                name,
                arguments,
                call_id,
            } => self.handle_tool_call(name, arguments, call_id),
            InboundEvent::SpeechStarted => {
                let barge = self.turn.on_user_speech_started();
                let in_flight = self.playback.active_count();
                let handles = self.playback.barge_in();
                self.send(OutboundEvent::InputAudioBufferClear);
                debug!(interrupted = barge.interrupted_speech, in_flight, "User started speaking");
                self.emit(EngineEvent::Interrupt { handles });
                self.emit_turn();
            }
            InboundEvent::UserTranscriptCompleted { transcript } => {
                if transcript.trim().is_empty() {
                    return;
                }
                info!(%transcript, "User turn");
                self.history.push(TranscriptTurn {
                    role: Speaker::User,
                    content: transcript,
                });
                self.spawn_secondary_inference();
            }
            InboundEvent::AgentTranscriptDone { transcript } => {
                if !transcript.trim().is_empty() {
                    info!(%transcript, "Agent turn");
                    self.history.push(TranscriptTurn {
                        role: Speaker::Assistant,
                        content: transcript,
                    });
                }
            }
            InboundEvent::ResponseDone => debug!("Agent response done"),
            InboundEvent::Error { .. } => {
                let message = event.error_message().unwrap_or_default();
                warn!(%message, "Remote agent reported an error");
                self.emit(EngineEvent::Diagnostic(message));
            }
            InboundEvent::Other => {}
        }
    }

    fn handle_tool_call(&mut self, name: Option<String>, arguments: String, call_id: String) {
        let acknowledge = !sidecar::is_sidecar_call(&call_id);
        let known = name.as_deref().is_none_or(|n| n == self.config.tool_name);

        if !known {
            warn!(call_id = %call_id, name = ?name, "Agent called an unknown tool");
            self.emit(EngineEvent::Diagnostic(format!(
                "Ignored call to unknown tool {}",
                name.unwrap_or_default()
            )));
            if acknowledge {
                self.acknowledge(&call_id, json!({"success": false, "error": "unknown tool"}));
            }
            return;
        }

        let Some(reducer) = &self.reducer else {
            warn!(call_id = %call_id, "No active session; dropping tool call");
            return;
        };
        let elapsed = self.lifecycle.elapsed(now());
        debug!(call_id = %call_id, elapsed_secs = elapsed.as_secs(), "Queueing tool call");
        reducer.submit(call_id.clone(), arguments, elapsed);

        if acknowledge {
            self.acknowledge(&call_id, json!({"success": true}));
        }
    }

    fn acknowledge(&self, call_id: &str, output: serde_json::Value) {
        self.send(OutboundEvent::function_call_output(call_id, &output));
        self.send(OutboundEvent::ResponseCreate);
    }

    /// Runs the sidecar assessor over the transcript so far.
    ///
    /// Tasks live in the engine's `JoinSet` and are aborted when the session is released.
    fn spawn_secondary_inference(&mut self) {
        let Some(assessor) = self.assessor.clone() else {
            return;
        };
        let history = self.history.clone();
        let injected = self.injected_tx.clone();
        let tool_name = self.config.tool_name.clone();
        self.inference_tasks.spawn(
            async move {
                debug!(turns = history.len(), "Running secondary assessment");
                match assessor.analyze(&history).await {
                    Ok(assessment) => {
                        let event = sidecar::injected_tool_call(&tool_name, assessment);
                        if injected.send(event).is_err() {
                            debug!("Engine gone; secondary assessment dropped");
                        }
                    }
                    Err(e) => warn!(error = %e, "Secondary assessment failed"),
                }
            }
            .in_current_span(),
        );
    }

    fn handle_reducer_event(&mut self, event: ReducerEvent) {
        match event {
            ReducerEvent::StateUpdated(state) => {
                self.latest = state.clone();
                self.emit(EngineEvent::StateUpdated(state));
            }
            ReducerEvent::Diagnostic { call_id, message } => {
                debug!(call_id = %call_id, "Reducer diagnostic");
                self.emit(EngineEvent::Diagnostic(message));
            }
            ReducerEvent::CompletionRequested => {
                if let Err(e) = self.lifecycle.complete() {
                    warn!(error = %e, "Ignoring completion");
                    return;
                }
                self.transport = None;
                self.capture.stop();
                let handles = self.playback.barge_in();
                if !handles.is_empty() {
                    self.emit(EngineEvent::Interrupt { handles });
                }
                self.emit(EngineEvent::Lifecycle(self.lifecycle.state().clone()));
            }
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) -> ControlFlow<()> {
        match command {
            EngineCommand::MicFrame(samples) => {
                if self.lifecycle.is_connected() {
                    let frame = self.capture.on_frame(&samples, &self.turn, now());
                    self.emit(EngineEvent::InputLevel {
                        level: frame.level,
                        echo_likelihood: frame.echo_likelihood,
                    });
                    match (frame.chunk, frame.gated) {
                        (Some(audio), _) => {
                            self.send(OutboundEvent::InputAudioBufferAppend { audio })
                        }
                        (None, Some(reason)) => trace!(?reason, "Microphone frame held back"),
                        (None, None) => {}
                    }
                }
            }
            EngineCommand::SetMuted(muted) => self.capture.set_muted(muted),
            EngineCommand::Pause => match self.lifecycle.pause(now()) {
                Ok(()) => {
                    self.capture.set_paused(true);
                    self.playback.suspend();
                    debug!(queued_until = self.playback.next_start_time(), "Playback suspended");
                    self.emit(EngineEvent::Lifecycle(self.lifecycle.state().clone()));
                }
                Err(e) => self.emit(EngineEvent::Error(e.to_string())),
            },
            EngineCommand::Resume => match self.lifecycle.resume(now()) {
                Ok(()) => {
                    self.capture.set_paused(false);
                    self.playback.resume();
                    self.emit(EngineEvent::Lifecycle(self.lifecycle.state().clone()));
                }
                Err(e) => self.emit(EngineEvent::Error(e.to_string())),
            },
            EngineCommand::Finalize { destination } => return self.finalize(destination).await,
            EngineCommand::Shutdown => {
                self.shutdown();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_tick(&mut self) -> ControlFlow<()> {
        let now = now();
        if let Some(PlaybackEvent::AgentFinished) = self.playback.poll() {
            self.turn.on_agent_finished(now);
            self.emit_turn();
        }
        if self.turn.tick(now) {
            self.emit_turn();
        }

        match self.lifecycle.tick(now, &self.latest) {
            Some(LifecycleSignal::HardCutoff) => self.cutoff().await,
            Some(LifecycleSignal::EarlyExitAvailable) => {
                self.emit(EngineEvent::EarlyExitAvailable);
                ControlFlow::Continue(())
            }
            None => ControlFlow::Continue(()),
        }
    }

    /// The hard time limit ends the session regardless of assessment state.
    async fn cutoff(&mut self) -> ControlFlow<()> {
        self.transport = None;
        self.capture.stop();
        let handles = self.playback.barge_in();
        if !handles.is_empty() {
            self.emit(EngineEvent::Interrupt { handles });
        }
        self.emit(EngineEvent::CutoffReached);

        match self.config.destination.clone() {
            Some(destination) => {
                if self.finalize(destination).await.is_continue() {
                    self.shutdown();
                }
            }
            None => {
                info!("No destination known at cutoff; ending without finalize");
                self.shutdown();
            }
        }
        ControlFlow::Break(())
    }

    /// Waits for every queued update, hands the result to the review
    /// collaborator and tears the session down. A failed hand-off keeps the
    /// session so the host can try again.
    async fn finalize(&mut self, destination: String) -> ControlFlow<()> {
        let snapshot = match &self.reducer {
            Some(reducer) => reducer.snapshot().await,
            None => None,
        }
        .unwrap_or_else(|| (*self.latest).clone());

        let payload = match self.lifecycle.finalize(&snapshot, destination) {
            Ok(payload) => payload,
            Err(e) => {
                self.emit(EngineEvent::Error(e.to_string()));
                return ControlFlow::Continue(());
            }
        };

        info!(
            destination = %payload.destination,
            turn_count = payload.turn_count,
            "Finalizing session"
        );
        match self.collaborator.finalize(&payload).await {
            Ok(outcome) => {
                self.emit(EngineEvent::Finalized(outcome));
                self.shutdown();
                ControlFlow::Break(())
            }
            Err(e) => {
                error!(error = %e, "Review hand-off failed");
                self.emit(EngineEvent::Error(format!("Could not finalize session: {e}")));
                ControlFlow::Continue(())
            }
        }
    }

    /// Releases every session resource and reports `Disconnected`.
    fn shutdown(&mut self) {
        self.release();
        self.lifecycle.disconnect();
        self.latest = Arc::new(SessionState::new());
        self.emit(EngineEvent::Lifecycle(self.lifecycle.state().clone()));
    }

    fn release(&mut self) {
        self.capture.stop();
        let handles = self.playback.barge_in();
        if !handles.is_empty() {
            self.emit(EngineEvent::Interrupt { handles });
        }
        self.transport = None;
        self.reducer = None;
        self.reducer_events = None;
        self.history.clear();
        if !self.inference_tasks.is_empty() {
            debug!(pending = self.inference_tasks.len(), "Aborting secondary assessments");
            self.inference_tasks.abort_all();
        }
    }

    fn send(&self, event: OutboundEvent) {
        if let Some(transport) = &self.transport {
            let _ = transport.send(event);
        }
    }

    fn emit_turn(&self) {
        self.emit(EngineEvent::Turn(self.turn.state().into()));
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("Host gone; engine event dropped");
        }
    }
}
