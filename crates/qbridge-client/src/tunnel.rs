//! Client role of a tunnelled stream.
//!
//! For every accepted TCP client the factory opens a stream on the shared
//! transport and sends the `CONNECT` header. Only then is the bridge handed
//! back to the reactor, so no client byte can precede the header. Bytes coming
//! back from the relay are copied to the client by a separate task.

use crate::supervisor::TransportSupervisor;
use qbridge_core::bridge::{
    next_stream_id, pump, Bridge, BridgeFactory, BridgeFuture, ConnectionPeer, QuicBridge,
    TcpBridge,
};
use qbridge_core::{ConnectHeader, StreamFailure, StreamFailureCause, StreamState, TunnelError};
use quinn::RecvStream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct TunnelBridgeFactory {
    supervisor: Arc<TransportSupervisor>,
    target: ConnectHeader,
    buffer_size: usize,
}

impl TunnelBridgeFactory {
    pub fn new(
        supervisor: Arc<TransportSupervisor>,
        target: ConnectHeader,
        buffer_size: usize,
    ) -> Self {
        Self {
            supervisor,
            target,
            buffer_size,
        }
    }

    pub fn target(&self) -> &ConnectHeader {
        &self.target
    }
}

impl BridgeFactory for TunnelBridgeFactory {
    fn new_instance(&self, peer: ConnectionPeer) -> BridgeFuture<'_, Box<dyn Bridge>> {
        Box::pin(async move {
            let stream_id = next_stream_id();
            let (send, recv) = self.supervisor.open_stream().await?;
            let mut stream = QuicBridge::new(stream_id, send);

            let header = self.target.encode();
            tokio::time::timeout(self.supervisor.open_timeout(), stream.write(&header))
                .await
                .map_err(|_| TunnelError::StreamOpen("header write timed out".into()))?
                .map_err(|e| TunnelError::StreamOpen(format!("header write: {e}")))?;

            info!(
                conn_id = peer.conn_id,
                stream_id,
                peer = %peer.peer_addr,
                target = %self.target,
                "stream opened"
            );

            tokio::spawn(relay_to_client(
                stream_id,
                recv,
                TcpBridge::new(peer.writer),
                peer.shutdown.clone(),
                self.buffer_size,
            ));

            Ok(Box::new(TunnelBridge {
                stream,
                shutdown: peer.shutdown,
                state: StreamState::Relaying,
            }) as Box<dyn Bridge>)
        })
    }
}

/// Copies relay bytes to the TCP client until either side ends.
async fn relay_to_client(
    stream_id: u64,
    mut recv: RecvStream,
    mut client: TcpBridge,
    shutdown: CancellationToken,
    buffer_size: usize,
) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        copied = pump(&mut recv, &mut client, buffer_size) => match copied {
            Ok(bytes) => debug!(stream_id, bytes, "relay finished the stream"),
            Err(e) => {
                let failure = stream_failure(stream_id, e);
                debug!(stream_id, error = %failure, "stream failed");
            }
        },
    }
    let _ = client.close().await;
    shutdown.cancel();
}

/// Attribute a relay-to-client copy error to its stream.
fn stream_failure(stream_id: u64, err: TunnelError) -> StreamFailure {
    match err {
        TunnelError::Stream(failure) => failure,
        other => StreamFailure::new(stream_id, StreamFailureCause::Io(other.to_string())),
    }
}

/// Carries one TCP client's bytes onto its stream.
pub struct TunnelBridge {
    stream: QuicBridge,
    shutdown: CancellationToken,
    state: StreamState,
}

impl TunnelBridge {
    pub fn state(&self) -> StreamState {
        self.state
    }
}

impl Bridge for TunnelBridge {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BridgeFuture<'a, ()> {
        Box::pin(async move {
            if self.state != StreamState::Relaying {
                return Err(TunnelError::Other(format!(
                    "stream {} is not relaying",
                    self.stream.stream_id()
                )));
            }
            self.stream.write(data).await
        })
    }

    fn close(&mut self) -> BridgeFuture<'_, ()> {
        Box::pin(async move {
            if self.state == StreamState::Closed {
                return Ok(());
            }
            self.state = StreamState::Closed;
            self.stream.close().await?;
            self.shutdown.cancel();
            debug!(stream_id = self.stream.stream_id(), "stream closed");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_errors_are_attributed_to_the_stream() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection lost");
        let failure = stream_failure(7, TunnelError::Io(io));
        assert_eq!(failure.stream_id, 7);
        assert!(matches!(
            failure.cause,
            StreamFailureCause::Io(ref m) if m.contains("connection lost")
        ));
        assert!(failure.to_string().starts_with("stream 7 failed"));
    }

    #[test]
    fn stream_failures_pass_through() {
        let original = StreamFailure::new(3, StreamFailureCause::Io("QUIC write: reset".into()));
        let failure = stream_failure(9, TunnelError::Stream(original));
        assert_eq!(failure.stream_id, 3);
        assert_eq!(failure.cause, StreamFailureCause::Io("QUIC write: reset".into()));
    }
}
