//! Manages the browser WebSocket connection for a coaching session.

use super::{
    protocol::{ClientMessage, ServerMessage},
    provider,
};
use crate::state::AppState;
use anyhow::{Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use scope_core::{
    EngineCommand, EngineEvent, SessionEngine,
    audio::pcm16_le_to_f32,
    capture::InputStream,
    transport::Transport,
};
use std::sync::Arc;
use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
};
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

const TRANSPORT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 64;

type SocketSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// Performs the `init` handshake, connects the realtime agent, and then runs
/// the engine alongside the socket relay until either side ends the session.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    tracing::Span::current().record("session_id", session_id.to_string());
    info!("New WebSocket connection. Awaiting initialization...");

    let (socket_tx, mut socket_rx) = socket.split();
    let socket_tx = Arc::new(Mutex::new(socket_tx));

    // The first message from the client must be an `init` message.
    let init = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => parse_init(&text),
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };
    let (input, destination) = match init {
        Ok(init) => init,
        Err(e) => {
            error!("Session initialization failed: {:?}", e);
            report_error(&socket_tx, e.to_string()).await;
            return;
        }
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut engine = SessionEngine::new(
        state.engine_config(destination),
        state.collaborator.clone(),
        state.assessor.clone(),
        events_tx,
    );
    if let Err(e) = engine.begin(&input) {
        warn!(error = %e, "Session could not start.");
        report_error(&socket_tx, e.to_string()).await;
        return;
    }

    if send_msg(
        &mut *socket_tx.lock().await,
        ServerMessage::Initialized { session_id },
    )
    .await
    .is_err()
    {
        error!("Failed to send Initialized message to client.");
        return;
    }

    let realtime = match provider::connect(&state.config).await {
        Ok(ws) => ws,
        Err(e) => {
            error!(error = ?e, "Could not reach the realtime agent.");
            report_error(&socket_tx, format!("realtime connection failed: {e}")).await;
            return;
        }
    };

    let (transport, remote) = Transport::channel(TRANSPORT_CAPACITY);
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

    tokio::spawn(
        async move {
            if let Err(e) = provider::pump(realtime, remote).await {
                warn!(error = ?e, "Realtime relay ended with error.");
            }
        }
        .instrument(tracing::info_span!("realtime_relay")),
    );

    let session_span = tracing::info_span!("scope_session", %session_id);
    tokio::spawn(
        async move {
            match engine.run(transport, commands_rx).await {
                Ok(()) => info!("Engine finished."),
                Err(e) => error!(error = %e, "Engine terminated with error."),
            }
        }
        .instrument(session_span.clone()),
    );

    if let Err(e) = relay_socket(socket_tx, socket_rx, commands_tx, events_rx)
        .instrument(session_span)
        .await
    {
        error!(error = ?e, "Session relay terminated with error.");
    }
    info!("WebSocket connection closed.");
}

fn parse_init(text: &str) -> Result<(InputStream, Option<String>)> {
    match serde_json::from_str::<ClientMessage>(text)? {
        ClientMessage::Init {
            sample_rate,
            microphone,
            destination,
        } => Ok((
            InputStream {
                sample_rate,
                permission: microphone,
            },
            destination,
        )),
        _ => Err(anyhow!("First message must be `init`")),
    }
}

/// Maps a post-init client message onto an engine command.
fn to_command(msg: ClientMessage) -> Option<EngineCommand> {
    match msg {
        ClientMessage::Init { .. } => None,
        ClientMessage::SetMuted { muted } => Some(EngineCommand::SetMuted(muted)),
        ClientMessage::Pause => Some(EngineCommand::Pause),
        ClientMessage::Resume => Some(EngineCommand::Resume),
        ClientMessage::Finalize { destination } => Some(EngineCommand::Finalize { destination }),
        ClientMessage::End => Some(EngineCommand::Shutdown),
    }
}

/// Pumps client frames into the engine and engine events back to the client.
///
/// Ends when the engine drops its event channel (finalized, shut down, or
/// transport lost) or when the client goes away.
async fn relay_socket(
    socket_tx: SocketSink,
    mut socket_rx: SplitStream<WebSocket>,
    commands: mpsc::Sender<EngineCommand>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) -> Result<()> {
    let mut client_open = true;

    loop {
        tokio::select! {
            msg = socket_rx.next(), if client_open => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => match to_command(msg) {
                        Some(command) => {
                            if commands.send(command).await.is_err() {
                                debug!("Engine stopped; ignoring client command.");
                            }
                        }
                        None => warn!("Ignoring repeated `init` message."),
                    },
                    Err(e) => warn!(error = %e, "Ignoring malformed client message."),
                },
                Some(Ok(Message::Binary(data))) => {
                    match commands.try_send(EngineCommand::MicFrame(pcm16_le_to_f32(&data))) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => warn!("Engine busy; dropping microphone frame."),
                        Err(TrySendError::Closed(_)) => {}
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client closed the connection. Shutting down session.");
                    let _ = commands.send(EngineCommand::Shutdown).await;
                    client_open = false;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    error!("Error receiving from client WebSocket: {:?}", e);
                    let _ = commands.send(EngineCommand::Shutdown).await;
                    client_open = false;
                }
            },
            event = events.recv() => match event {
                Some(event) => {
                    if client_open {
                        send_msg(&mut *socket_tx.lock().await, ServerMessage::from(event)).await?;
                    }
                }
                None => break,
            },
        }
    }

    if client_open {
        let _ = socket_tx.lock().await.close().await;
    }
    Ok(())
}

async fn report_error(socket_tx: &SocketSink, message: String) {
    let mut sink = socket_tx.lock().await;
    let _ = send_msg(&mut sink, ServerMessage::Error { message }).await;
    let _ = sink.close().await;
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
