//! The bridge abstraction: "the other side" of a socket.
//!
//! A [`Bridge`] is a `{write, close}` capability pair. Whoever reads bytes off
//! one side hands them to the bridge, without knowing whether they travel over
//! a QUIC stream or a TCP socket. Two stock bridges cover both directions of a
//! tunnel: [`TcpBridge`] and [`QuicBridge`].

use crate::error::{StreamFailure, StreamFailureCause, TunnelError, TunnelResult};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Boxed future returned by bridge methods (keeps the traits object-safe).
pub type BridgeFuture<'a, T> = Pin<Box<dyn Future<Output = TunnelResult<T>> + Send + 'a>>;

/// Write/close capability for the far side of a connection.
pub trait Bridge: Send {
    /// Write all of `data`. The bridge does not keep the slice after returning.
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BridgeFuture<'a, ()>;

    /// Close the far side. Calling it more than once is a no-op.
    fn close(&mut self) -> BridgeFuture<'_, ()>;
}

/// An accepted TCP client, as handed to a [`BridgeFactory`].
///
/// The reactor keeps the read half; the factory receives the write half so
/// that bytes coming back can be delivered to the client. Cancelling
/// `shutdown` tells the reactor to stop reading and drop the socket.
pub struct ConnectionPeer {
    pub conn_id: u64,
    pub peer_addr: SocketAddr,
    pub writer: OwnedWriteHalf,
    pub shutdown: CancellationToken,
}

/// Creates one [`Bridge`] per accepted connection.
pub trait BridgeFactory: Send + Sync {
    fn new_instance(&self, peer: ConnectionPeer) -> BridgeFuture<'_, Box<dyn Bridge>>;
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique stream id for logging and failure reports.
pub fn next_stream_id() -> u64 {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// Bridge that writes into a TCP socket's write half.
pub struct TcpBridge {
    writer: Option<OwnedWriteHalf>,
}

impl TcpBridge {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: Some(writer),
        }
    }
}

impl Bridge for TcpBridge {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BridgeFuture<'a, ()> {
        Box::pin(async move {
            let writer = self.writer.as_mut().ok_or_else(|| {
                TunnelError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "tcp bridge closed",
                ))
            })?;
            writer.write_all(data).await?;
            Ok(())
        })
    }

    fn close(&mut self) -> BridgeFuture<'_, ()> {
        Box::pin(async move {
            if let Some(mut writer) = self.writer.take() {
                // The peer may already be gone.
                let _ = writer.shutdown().await;
            }
            Ok(())
        })
    }
}

/// Bridge that writes into a QUIC send stream.
pub struct QuicBridge {
    stream_id: u64,
    send: Option<quinn::SendStream>,
}

impl QuicBridge {
    pub fn new(stream_id: u64, send: quinn::SendStream) -> Self {
        Self {
            stream_id,
            send: Some(send),
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Abort the stream instead of finishing it, so the peer sees an error
    /// rather than a clean end of data.
    pub fn reset(&mut self, code: u32) {
        if let Some(mut send) = self.send.take() {
            let _ = send.reset(code.into());
        }
    }
}

impl Bridge for QuicBridge {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BridgeFuture<'a, ()> {
        Box::pin(async move {
            let stream_id = self.stream_id;
            let send = self.send.as_mut().ok_or_else(|| {
                StreamFailure::new(stream_id, StreamFailureCause::Io("stream closed".into()))
            })?;
            send.write_all(data).await.map_err(|e| {
                StreamFailure::new(stream_id, StreamFailureCause::Io(format!("QUIC write: {e}")))
            })?;
            Ok(())
        })
    }

    fn close(&mut self) -> BridgeFuture<'_, ()> {
        Box::pin(async move {
            if let Some(mut send) = self.send.take() {
                // Already finished or reset by the peer.
                let _ = send.finish();
                trace!(stream_id = self.stream_id, "QUIC send stream finished");
            }
            Ok(())
        })
    }
}

/// Copy everything `reader` yields into `bridge` until end of stream.
///
/// Returns the number of bytes forwarded. Read errors surface as
/// [`TunnelError::Io`]; write errors are whatever the bridge reports. The
/// bridge is not closed here; the caller owns teardown.
pub async fn pump<R>(
    reader: &mut R,
    bridge: &mut dyn Bridge,
    buf_size: usize,
) -> TunnelResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        bridge.write(&buf[..n]).await?;
        total += n as u64;
    }
}
