use std::fmt;
use thiserror::Error;

/// Errors produced by the tunnel core.
///
/// Every variant is contained to the connection or stream that produced it;
/// none of them is fatal to the process.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("accept failed: {0}")]
    Accept(String),

    #[error("transport connect failed: {0}")]
    TransportConnect(String),

    #[error("stream open failed: {0}")]
    StreamOpen(String),

    #[error(transparent)]
    Stream(#[from] StreamFailure),

    #[error("dial {host}:{port} failed: {reason}")]
    Dial {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("tls error: {0}")]
    Tls(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<rustls::Error> for TunnelError {
    fn from(e: rustls::Error) -> Self {
        TunnelError::Tls(e.to_string())
    }
}

impl From<rcgen::Error> for TunnelError {
    fn from(e: rcgen::Error) -> Self {
        TunnelError::Tls(format!("certificate generation: {e}"))
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;

/// A failed multiplexed stream: the cause plus the stream it happened on.
#[derive(Debug, Error)]
#[error("stream {stream_id} failed: {cause}")]
pub struct StreamFailure {
    pub stream_id: u64,
    pub cause: StreamFailureCause,
}

impl StreamFailure {
    pub fn new(stream_id: u64, cause: StreamFailureCause) -> Self {
        Self { stream_id, cause }
    }
}

/// Why a stream was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFailureCause {
    /// No newline within the header capacity.
    HeaderTooLong { limit: usize },
    /// The header line is not `CONNECT <host> <port>`.
    MalformedHeader(String),
    /// The port token is not a number in `1..=65535`.
    InvalidPort(String),
    /// The stream ended before a complete header arrived.
    HeaderIncomplete,
    /// The target was rejected by the relay's policy.
    PolicyDenied(String),
    /// The target could not be reached.
    Dial(String),
    /// Read/write failure on either side while relaying.
    Io(String),
    /// A bounded wait expired.
    Timeout(&'static str),
}

impl fmt::Display for StreamFailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderTooLong { limit } => {
                write!(f, "header exceeds {limit} bytes without newline")
            }
            Self::MalformedHeader(line) => write!(f, "malformed header: {line:?}"),
            Self::InvalidPort(port) => write!(f, "invalid port: {port:?}"),
            Self::HeaderIncomplete => write!(f, "stream ended before header was complete"),
            Self::PolicyDenied(reason) => write!(f, "policy denied: {reason}"),
            Self::Dial(reason) => write!(f, "dial failed: {reason}"),
            Self::Io(reason) => write!(f, "io: {reason}"),
            Self::Timeout(phase) => write!(f, "{phase} timed out"),
        }
    }
}
