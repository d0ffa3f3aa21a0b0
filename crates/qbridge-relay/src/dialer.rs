//! Outbound TCP connections to `CONNECT` targets.

use qbridge_core::{TunnelError, TunnelResult};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Resolves a target and connects to the first address that answers.
#[derive(Debug, Clone)]
pub struct TargetDialer {
    timeout: Duration,
}

impl TargetDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Resolve `host` and try each address in order. Resolution and all
    /// attempts share one deadline.
    pub async fn dial(&self, host: &str, port: u16) -> TunnelResult<TcpStream> {
        let fail = |reason: String| TunnelError::Dial {
            host: host.to_string(),
            port,
            reason,
        };

        tokio::time::timeout(self.timeout, self.connect_any(host, port))
            .await
            .map_err(|_| fail(format!("timed out after {:?}", self.timeout)))?
            .map_err(fail)
    }

    async fn connect_any(&self, host: &str, port: u16) -> Result<TcpStream, String> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| format!("resolve: {e}"))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(host, port, addr = %addr, "target connected");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(host, port, addr = %addr, error = %e, "target address failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => e.to_string(),
            None => "no addresses resolved".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_listening_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dialer = TargetDialer::new(Duration::from_secs(5));
        let stream = dialer.dial("127.0.0.1", port).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn refused_target_is_a_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = TargetDialer::new(Duration::from_secs(5));
        let err = dialer.dial("127.0.0.1", port).await.unwrap_err();
        match err {
            TunnelError::Dial { host, port: p, .. } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(p, port);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unresolvable_host_is_a_dial_error() {
        let dialer = TargetDialer::new(Duration::from_secs(5));
        let err = dialer.dial("invalid host name", 80).await.unwrap_err();
        assert!(matches!(err, TunnelError::Dial { .. }));
    }
}
