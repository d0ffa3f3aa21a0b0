//! qbridge-core: shared pieces of the TCP-over-QUIC tunnel.
//!
//! Provides the `CONNECT` header codec, the bridge abstraction with its TCP and
//! QUIC implementations, rustls/quinn configuration, and development
//! certificate generation.

pub mod bridge;
pub mod certs;
pub mod error;
pub mod header;
pub mod quic;
pub mod tls;

// Re-export commonly used items at crate root.
pub use bridge::{
    pump, Bridge, BridgeFactory, BridgeFuture, ConnectionPeer, QuicBridge, TcpBridge,
};
pub use error::{StreamFailure, StreamFailureCause, TunnelError, TunnelResult};
pub use header::{ConnectHeader, HeaderDecoder, StreamState, DEFAULT_HEADER_LIMIT};
pub use quic::{QuicSettings, ALPN};
pub use tls::{ClientTls, ServerTls};
