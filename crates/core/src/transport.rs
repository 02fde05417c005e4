//! Duplex channel to the remote voice agent.
//!
//! The engine never touches a socket. It holds a `Transport`, a pair of
//! bounded channels, and whoever owns the `RemoteEnd` pumps those events over
//! the real connection. Dropping the `Transport` closes the connection.

use crate::protocol::{InboundEvent, OutboundEvent};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport send buffer full; dropped {0}")]
    Full(&'static str),
}

pub struct Transport {
    outbound: mpsc::Sender<OutboundEvent>,
    inbound: mpsc::Receiver<InboundEvent>,
}

/// The far side of a `Transport`, driven by the provider bridge or a test.
pub struct RemoteEnd {
    pub outbound: mpsc::Receiver<OutboundEvent>,
    pub inbound: mpsc::Sender<InboundEvent>,
}

impl Transport {
    pub fn channel(capacity: usize) -> (Transport, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (
            Transport {
                outbound: out_tx,
                inbound: in_rx,
            },
            RemoteEnd {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }

    /// Fire-and-forget send. Failures are logged and returned, never retried.
    pub fn send(&self, event: OutboundEvent) -> Result<(), TransportError> {
        let kind = event.kind();
        let result = self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full(kind),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        });
        if let Err(e) = &result {
            warn!(event = kind, error = %e, "Transport send failed");
        }
        result
    }

    /// Next inbound event; `None` once the remote side has gone away.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.inbound.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_through_remote_end() {
        let (mut transport, mut remote) = Transport::channel(4);
        transport.send(OutboundEvent::ResponseCreate).unwrap();
        assert_eq!(remote.outbound.recv().await, Some(OutboundEvent::ResponseCreate));

        remote.inbound.send(InboundEvent::SpeechStarted).await.unwrap();
        assert_eq!(transport.recv().await, Some(InboundEvent::SpeechStarted));

        drop(remote);
        assert_eq!(transport.recv().await, None);
    }

    #[test]
    fn test_send_failures_are_reported() {
        let (transport, remote) = Transport::channel(1);
        transport.send(OutboundEvent::ResponseCreate).unwrap();
        assert_eq!(
            transport.send(OutboundEvent::InputAudioBufferClear),
            Err(TransportError::Full("input_audio_buffer.clear"))
        );
        drop(remote);
        assert_eq!(
            transport.send(OutboundEvent::ResponseCreate),
            Err(TransportError::Closed)
        );
    }
}
