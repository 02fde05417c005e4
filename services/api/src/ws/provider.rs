//! Bridges an engine `Transport` to the OpenAI Realtime WebSocket.

use crate::config::Config;
use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use scope_core::{protocol::InboundEvent, transport::RemoteEnd};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, info, warn};

const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Opens the realtime connection for the configured model.
pub async fn connect(config: &Config) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let url = format!("{}?model={}", REALTIME_URL, config.realtime_model);
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", config.openai_api_key).parse()?,
    );
    request
        .headers_mut()
        .insert("OpenAI-Beta", "realtime=v1".parse()?);

    let (ws_stream, _) = connect_async(request)
        .await
        .context("Failed to connect to OpenAI Realtime WebSocket")?;
    info!(model = %config.realtime_model, "Connected to OpenAI Realtime API.");
    Ok(ws_stream)
}

/// Relays events between the engine and the remote socket until either side closes.
///
/// Returning drops `remote`, which the engine observes as a closed transport.
pub async fn pump<S>(ws: S, mut remote: RemoteEnd) -> Result<()>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin,
{
    let (mut openai_tx, mut openai_rx) = ws.split();

    loop {
        tokio::select! {
            biased;
            // Events from the engine.
            event = remote.outbound.recv() => match event {
                Some(event) => {
                    openai_tx
                        .send(WsMessage::Text(serde_json::to_string(&event)?.into()))
                        .await
                        .with_context(|| format!("Failed to send {}", event.kind()))?;
                }
                None => {
                    info!("Engine closed the transport; closing realtime connection.");
                    let _ = openai_tx.close().await;
                    return Ok(());
                }
            },
            // Events from OpenAI.
            msg = openai_rx.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<InboundEvent>(&text) {
                    Ok(InboundEvent::Other) => {}
                    Ok(event) => {
                        if remote.inbound.send(event).await.is_err() {
                            debug!("Engine gone; stopping relay.");
                            return Ok(());
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring unparseable realtime event"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(?frame, "Realtime connection closed by remote.");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("Realtime connection failed"),
                None => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scope_core::{protocol::OutboundEvent, transport::Transport};
    use std::time::Duration;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_pump_relays_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(r#"{"type":"session.created"}"#.into()))
                .await
                .unwrap();
            ws.send(WsMessage::Text("not json".into())).await.unwrap();
            ws.send(WsMessage::Text(
                r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":120}"#.into(),
            ))
            .await
            .unwrap();

            let msg = ws.next().await.unwrap().unwrap();
            let value: serde_json::Value = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
            assert_eq!(value["type"], "response.create");
            ws.close(None).await.unwrap();
        });

        let (client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (mut transport, remote) = Transport::channel(8);
        let relay = tokio::spawn(pump(client, remote));

        let first = tokio::time::timeout(WAIT, transport.recv()).await.unwrap();
        assert_eq!(first, Some(InboundEvent::SpeechStarted));

        transport.send(OutboundEvent::ResponseCreate).unwrap();
        tokio::time::timeout(WAIT, server).await.unwrap().unwrap();

        let closed = tokio::time::timeout(WAIT, transport.recv()).await.unwrap();
        assert_eq!(closed, None);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropping_transport_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | None => return true,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return false,
                }
            }
        });

        let (client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (transport, remote) = Transport::channel(8);
        let relay = tokio::spawn(pump(client, remote));
        drop(transport);

        assert!(tokio::time::timeout(WAIT, server).await.unwrap().unwrap());
        relay.await.unwrap().unwrap();
    }
}
