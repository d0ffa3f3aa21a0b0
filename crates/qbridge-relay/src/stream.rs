//! Relay role of a tunnelled stream.
//!
//! Reads the `CONNECT` header, checks the target against policy, dials it,
//! then copies bytes both ways until either side ends. Any failure before
//! relaying resets the stream, so the client never waits on a stream that has
//! no target behind it.

use crate::dialer::TargetDialer;
use crate::policy::PolicyEnforcer;
use qbridge_core::bridge::{pump, Bridge, QuicBridge, TcpBridge};
use qbridge_core::{
    ConnectHeader, HeaderDecoder, StreamFailure, StreamFailureCause, StreamState, TunnelError,
    DEFAULT_HEADER_LIMIT,
};
use quinn::{RecvStream, SendStream};
use std::time::Duration;
use tracing::{debug, info};

/// Reset code sent when the header is rejected.
pub const RESET_BAD_HEADER: u32 = 1;
/// Reset code sent when policy refuses the target.
pub const RESET_DENIED: u32 = 2;
/// Reset code sent when the target cannot be reached.
pub const RESET_UNREACHABLE: u32 = 3;

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Header line cap, newline included.
    pub header_limit: usize,
    pub handshake_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            header_limit: DEFAULT_HEADER_LIMIT,
            handshake_timeout: Duration::from_secs(10),
            buffer_size: 16 * 1024,
        }
    }
}

/// Which side ended a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Target,
}

#[derive(Debug)]
pub struct RelaySummary {
    pub target: ConnectHeader,
    pub closed_by: ClosedBy,
    /// Bytes copied by the direction that finished first.
    pub bytes: u64,
}

pub struct RelayStream {
    stream_id: u64,
    send: QuicBridge,
    recv: RecvStream,
    state: StreamState,
    decoder: Option<HeaderDecoder>,
    settings: StreamSettings,
}

impl RelayStream {
    pub fn new(
        stream_id: u64,
        send: SendStream,
        recv: RecvStream,
        settings: StreamSettings,
    ) -> Self {
        Self {
            stream_id,
            send: QuicBridge::new(stream_id, send),
            recv,
            state: StreamState::AwaitingHeader,
            decoder: Some(HeaderDecoder::new(settings.header_limit)),
            settings,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Drive the stream to completion. Both sides are closed on return.
    pub async fn run(
        &mut self,
        policy: &PolicyEnforcer,
        dialer: &TargetDialer,
    ) -> Result<RelaySummary, StreamFailure> {
        let result = self.handshake_and_relay(policy, dialer).await;
        if let Err(cause) = &result {
            if self.state == StreamState::AwaitingHeader {
                let code = match cause {
                    StreamFailureCause::PolicyDenied(_) => RESET_DENIED,
                    StreamFailureCause::Dial(_) => RESET_UNREACHABLE,
                    _ => RESET_BAD_HEADER,
                };
                self.send.reset(code);
                let _ = self.recv.stop(code.into());
            }
        }
        let _ = self.send.close().await;
        self.state = StreamState::Closed;
        result.map_err(|cause| StreamFailure::new(self.stream_id, cause))
    }

    async fn handshake_and_relay(
        &mut self,
        policy: &PolicyEnforcer,
        dialer: &TargetDialer,
    ) -> Result<RelaySummary, StreamFailureCause> {
        let (target, remainder) =
            tokio::time::timeout(self.settings.handshake_timeout, self.read_header())
                .await
                .map_err(|_| StreamFailureCause::Timeout("header read"))??;
        debug!(stream_id = self.stream_id, target = %target, "header parsed");

        let _slot = policy
            .admit(&target)
            .map_err(StreamFailureCause::PolicyDenied)?;

        // The stream is not read while dialing, so the client's early bytes
        // wait in QUIC flow control.
        let socket = dialer
            .dial(&target.host, target.port)
            .await
            .map_err(|e| match e {
                TunnelError::Dial { reason, .. } => StreamFailureCause::Dial(reason),
                other => StreamFailureCause::Dial(other.to_string()),
            })?;

        self.state = StreamState::Relaying;
        info!(stream_id = self.stream_id, target = %target, "relaying");

        let (mut target_read, target_write) = socket.into_split();
        let mut to_target = TcpBridge::new(target_write);

        // Bytes that arrived with the header go out before anything else.
        let buffer_size = self.settings.buffer_size;
        let written = to_target.write(&remainder).await;
        let outcome = match written {
            Ok(()) => tokio::select! {
                copied = pump(&mut self.recv, &mut to_target, buffer_size) => {
                    copied.map(|bytes| (ClosedBy::Client, bytes))
                }
                copied = pump(&mut target_read, &mut self.send, buffer_size) => {
                    copied.map(|bytes| (ClosedBy::Target, bytes))
                }
            },
            Err(e) => Err(e),
        };

        let _ = to_target.close().await;
        let (closed_by, bytes) = outcome.map_err(|e| match e {
            TunnelError::Stream(failure) => failure.cause,
            other => StreamFailureCause::Io(other.to_string()),
        })?;

        Ok(RelaySummary {
            target,
            closed_by,
            bytes,
        })
    }

    /// Read until a full header line arrives. Returns the header and any
    /// payload bytes that followed it.
    async fn read_header(&mut self) -> Result<(ConnectHeader, Vec<u8>), StreamFailureCause> {
        let mut buf = vec![0u8; self.settings.buffer_size.clamp(1, DEFAULT_HEADER_LIMIT)];
        let result = loop {
            let Some(decoder) = self.decoder.as_mut() else {
                break Err(StreamFailureCause::HeaderIncomplete);
            };
            let n = match self.recv.read(&mut buf).await {
                Ok(Some(n)) => n,
                Ok(None) => break Err(StreamFailureCause::HeaderIncomplete),
                Err(e) => break Err(StreamFailureCause::Io(format!("QUIC read: {e}"))),
            };
            match decoder.feed(&buf[..n]) {
                Ok(Some(done)) => break Ok((done.header, done.remainder)),
                Ok(None) => continue,
                Err(cause) => break Err(cause),
            }
        };
        // The header buffer is released here, once, whatever the outcome.
        self.decoder = None;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = StreamSettings::default();
        assert_eq!(settings.header_limit, 1024);
        assert_eq!(settings.handshake_timeout, Duration::from_secs(10));
    }
}
