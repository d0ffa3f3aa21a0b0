//! Lazily (re)established shared QUIC connection to the relay.

use qbridge_core::quic;
use qbridge_core::{ClientTls, QuicSettings, TunnelError, TunnelResult};
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Relay address as `host:port`; resolved on every connect attempt.
    pub relay_addr: String,
    /// Name the relay certificate must be valid for.
    pub server_name: String,
    pub connect_timeout: Duration,
    pub open_timeout: Duration,
    /// Minimum spacing between two connect attempts.
    pub reconnect_backoff: Option<Duration>,
}

impl SupervisorConfig {
    pub fn new(relay_addr: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            server_name: server_name.into(),
            connect_timeout: Duration::from_secs(10),
            open_timeout: Duration::from_secs(10),
            reconnect_backoff: None,
        }
    }
}

/// Owns the one transport connection every tunnelled client shares.
///
/// Readers take the fast path through the read lock. A dead or missing
/// connection is replaced under the write lock, after re-checking, so
/// concurrent callers coalesce onto a single connect attempt. Callers that
/// queued behind a failed attempt get its error instead of retrying, so no
/// caller waits longer than one `connect_timeout` for the transport.
pub struct TransportSupervisor {
    config: SupervisorConfig,
    client_config: quinn::ClientConfig,
    slot: RwLock<Slot>,
    connects: AtomicU64,
}

/// Transport state guarded by the supervisor lock.
#[derive(Default)]
struct Slot {
    conn: Option<Connection>,
    /// Bumped once per connect attempt.
    attempt: u64,
    /// Reason the latest attempt failed; cleared on success.
    last_failure: Option<String>,
    last_attempt_at: Option<Instant>,
}

impl Slot {
    fn live(&self) -> Option<&Connection> {
        self.conn.as_ref().filter(|c| is_live(c))
    }
}

impl TransportSupervisor {
    pub fn new(
        config: SupervisorConfig,
        tls: &ClientTls,
        settings: &QuicSettings,
    ) -> TunnelResult<Self> {
        let crypto = qbridge_core::tls::client_crypto(tls)?;
        let client_config = quic::client_config(crypto, settings)?;
        Ok(Self::with_client_config(config, client_config))
    }

    pub fn with_client_config(
        config: SupervisorConfig,
        client_config: quinn::ClientConfig,
    ) -> Self {
        Self {
            config,
            client_config,
            slot: RwLock::new(Slot::default()),
            connects: AtomicU64::new(0),
        }
    }

    pub fn open_timeout(&self) -> Duration {
        self.config.open_timeout
    }

    /// Number of transports established so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Return the live transport, establishing a new one if needed.
    pub async fn get_connection(&self) -> TunnelResult<Connection> {
        let seen = {
            let slot = self.slot.read().await;
            if let Some(conn) = slot.live() {
                return Ok(conn.clone());
            }
            slot.attempt
        };

        let mut slot = self.slot.write().await;
        // Another caller may have reconnected while we waited.
        if let Some(conn) = slot.live() {
            return Ok(conn.clone());
        }
        if slot.attempt != seen {
            if let Some(reason) = &slot.last_failure {
                return Err(TunnelError::TransportConnect(reason.clone()));
            }
        }
        if let Some(conn) = slot.conn.take() {
            info!(reason = ?conn.close_reason(), "transport lost");
        }

        slot.attempt += 1;
        self.wait_for_backoff(&mut slot).await;
        match self.connect().await {
            Ok(conn) => {
                slot.conn = Some(conn.clone());
                slot.last_failure = None;
                Ok(conn)
            }
            Err(e) => {
                slot.last_failure = Some(match &e {
                    TunnelError::TransportConnect(reason) => reason.clone(),
                    other => other.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Open one bidirectional stream on the shared transport.
    ///
    /// Failures are returned to the caller; nothing is retried.
    pub async fn open_stream(&self) -> TunnelResult<(SendStream, RecvStream)> {
        let conn = self.get_connection().await?;
        match tokio::time::timeout(self.config.open_timeout, conn.open_bi()).await {
            Ok(Ok(pair)) => Ok(pair),
            Ok(Err(e)) => Err(TunnelError::StreamOpen(e.to_string())),
            Err(_) => Err(TunnelError::StreamOpen(format!(
                "timed out after {:?}",
                self.config.open_timeout
            ))),
        }
    }

    /// Close the current transport, if any. The next use reconnects.
    pub async fn close(&self) {
        if let Some(conn) = self.slot.write().await.conn.take() {
            conn.close(0u32.into(), b"client shutdown");
            info!("transport closed");
        }
    }

    async fn wait_for_backoff(&self, slot: &mut Slot) {
        let Some(backoff) = self.config.reconnect_backoff else {
            return;
        };
        let wait = slot
            .last_attempt_at
            .map(|at| backoff.saturating_sub(at.elapsed()))
            .unwrap_or_default();
        slot.last_attempt_at = Some(Instant::now() + wait);
        if !wait.is_zero() {
            debug!(?wait, "delaying reconnect");
            tokio::time::sleep(wait).await;
        }
    }

    async fn connect(&self) -> TunnelResult<Connection> {
        let timeout = self.config.connect_timeout;
        let conn = tokio::time::timeout(timeout, self.establish())
            .await
            .map_err(|_| {
                TunnelError::TransportConnect(format!(
                    "{}: timed out after {timeout:?}",
                    self.config.relay_addr
                ))
            })?
            .inspect_err(|e| {
                warn!(relay = %self.config.relay_addr, error = %e, "transport connect failed")
            })?;

        let n = self.connects.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            relay = %self.config.relay_addr,
            remote = %conn.remote_address(),
            connects = n,
            "transport established"
        );
        Ok(conn)
    }

    async fn establish(&self) -> TunnelResult<Connection> {
        let relay = &self.config.relay_addr;
        let remote = tokio::net::lookup_host(relay.as_str())
            .await
            .map_err(|e| TunnelError::TransportConnect(format!("resolve {relay}: {e}")))?
            .next()
            .ok_or_else(|| TunnelError::TransportConnect(format!("no addresses for {relay}")))?;

        // A fresh endpoint per attempt, so a dead socket is never reused.
        let local: SocketAddr = if remote.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(local)
            .map_err(|e| TunnelError::TransportConnect(format!("endpoint: {e}")))?;
        endpoint.set_default_client_config(self.client_config.clone());

        endpoint
            .connect(remote, &self.config.server_name)
            .map_err(|e| TunnelError::TransportConnect(format!("{relay}: {e}")))?
            .await
            .map_err(|e| TunnelError::TransportConnect(format!("{relay}: {e}")))
    }
}

fn is_live(conn: &Connection) -> bool {
    conn.close_reason().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn insecure_supervisor(relay_addr: &str, connect_timeout: Duration) -> TransportSupervisor {
        let mut config = SupervisorConfig::new(relay_addr, "localhost");
        config.connect_timeout = connect_timeout;
        let tls = ClientTls {
            insecure: true,
            ..ClientTls::default()
        };
        TransportSupervisor::new(config, &tls, &QuicSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn unreachable_relay_is_a_transport_connect_error() {
        // Nothing answers on this port, so the handshake times out.
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let supervisor = insecure_supervisor(&addr.to_string(), Duration::from_millis(200));

        let err = supervisor.get_connection().await.unwrap_err();
        assert!(matches!(err, TunnelError::TransportConnect(_)));
        assert_eq!(supervisor.connect_count(), 0);

        let err = supervisor.open_stream().await.unwrap_err();
        assert!(matches!(err, TunnelError::TransportConnect(_)));
    }

    #[tokio::test]
    async fn queued_callers_share_a_failed_attempt() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let timeout = Duration::from_millis(300);
        let supervisor = Arc::new(insecure_supervisor(&addr.to_string(), timeout));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let supervisor = supervisor.clone();
            tasks.push(tokio::spawn(async move {
                let started = Instant::now();
                let result = supervisor.open_stream().await;
                (started.elapsed(), result)
            }));
        }

        for task in tasks {
            let (waited, result) = task.await.unwrap();
            assert!(matches!(result, Err(TunnelError::TransportConnect(_))));
            assert!(waited < timeout * 3, "caller waited {waited:?}");
        }

        // A later caller starts a fresh attempt rather than replaying the failure.
        let started = Instant::now();
        assert!(supervisor.get_connection().await.is_err());
        assert!(started.elapsed() >= timeout);
        assert_eq!(supervisor.connect_count(), 0);
    }

    #[tokio::test]
    async fn unresolvable_relay_is_a_transport_connect_error() {
        let supervisor = insecure_supervisor("not-an-address", Duration::from_secs(1));
        let err = supervisor.get_connection().await.unwrap_err();
        assert!(matches!(err, TunnelError::TransportConnect(_)));
    }

    #[tokio::test]
    async fn close_without_transport_is_a_no_op() {
        let supervisor = insecure_supervisor("127.0.0.1:9", Duration::from_secs(1));
        supervisor.close().await;
        assert_eq!(supervisor.connect_count(), 0);
    }
}
