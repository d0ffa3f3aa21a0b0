//! QUIC endpoint configuration shared by client and relay.

use crate::error::{TunnelError, TunnelResult};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{IdleTimeout, TransportConfig, VarInt};
use std::sync::Arc;
use std::time::Duration;

/// ALPN token negotiated by both ends.
pub const ALPN: &[u8] = b"qbridge/1";

/// Transport parameters applied to every tunnel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicSettings {
    /// Connection is dropped after this long without any traffic.
    pub idle_timeout: Duration,
    /// `None` disables keep-alive pings.
    pub keep_alive_interval: Option<Duration>,
    /// Concurrent bidirectional streams the peer may open.
    pub max_bidi_streams: u32,
}

impl Default for QuicSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: Some(Duration::from_secs(10)),
            max_bidi_streams: 1000,
        }
    }
}

impl QuicSettings {
    pub fn transport_config(&self) -> TunnelResult<TransportConfig> {
        let idle = IdleTimeout::try_from(self.idle_timeout)
            .map_err(|e| TunnelError::Config(format!("idle timeout: {e}")))?;

        let mut transport = TransportConfig::default();
        transport
            .max_idle_timeout(Some(idle))
            .keep_alive_interval(self.keep_alive_interval)
            .max_concurrent_bidi_streams(VarInt::from_u32(self.max_bidi_streams))
            .max_concurrent_uni_streams(VarInt::from_u32(0));
        Ok(transport)
    }
}

/// Wrap a rustls client config for quinn.
pub fn client_config(
    crypto: rustls::ClientConfig,
    settings: &QuicSettings,
) -> TunnelResult<quinn::ClientConfig> {
    let quic = QuicClientConfig::try_from(crypto)
        .map_err(|e| TunnelError::Tls(format!("QUIC client crypto: {e}")))?;
    let mut config = quinn::ClientConfig::new(Arc::new(quic));
    config.transport_config(Arc::new(settings.transport_config()?));
    Ok(config)
}

/// Wrap a rustls server config for quinn.
pub fn server_config(
    crypto: rustls::ServerConfig,
    settings: &QuicSettings,
) -> TunnelResult<quinn::ServerConfig> {
    let quic = QuicServerConfig::try_from(crypto)
        .map_err(|e| TunnelError::Tls(format!("QUIC server crypto: {e}")))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(quic));
    config.transport_config(Arc::new(settings.transport_config()?));
    Ok(config)
}
