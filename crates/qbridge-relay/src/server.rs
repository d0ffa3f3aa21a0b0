//! Relay server: accepts QUIC connections and runs one [`RelayStream`] per
//! incoming bidirectional stream.

use crate::config::RelayConfig;
use crate::dialer::TargetDialer;
use crate::listener::{start_listener, AcceptedConnection};
use crate::policy::PolicyEnforcer;
use crate::stream::{RelayStream, StreamSettings};
use qbridge_core::bridge::next_stream_id;
use qbridge_core::{quic, tls, TunnelResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared by every connection task.
struct Shared {
    policy: PolicyEnforcer,
    dialer: TargetDialer,
    stream: StreamSettings,
}

pub struct RelayServer {
    endpoint: quinn::Endpoint,
    incoming: mpsc::Receiver<AcceptedConnection>,
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Load TLS material and bind the QUIC endpoint.
    pub fn bind(config: RelayConfig) -> TunnelResult<Self> {
        let crypto = tls::server_crypto(&config.tls)?;
        let server_config = quic::server_config(crypto, &config.quic)?;
        let (endpoint, incoming) = start_listener(config.listen, server_config)?;

        if config.tls.client_ca.is_some() {
            info!("client certificates required");
        }

        Ok(Self {
            endpoint,
            incoming,
            shared: Arc::new(Shared {
                policy: PolicyEnforcer::new(&config.policy),
                dialer: TargetDialer::new(config.dial_timeout),
                stream: config.stream,
            }),
        })
    }

    pub fn local_addr(&self) -> TunnelResult<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled, then close the endpoint.
    pub async fn run(mut self, shutdown: CancellationToken) -> TunnelResult<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.incoming.recv() => match accepted {
                    Some(accepted) => {
                        let shared = self.shared.clone();
                        let shutdown = shutdown.child_token();
                        tokio::spawn(handle_connection(accepted, shared, shutdown));
                    }
                    None => break,
                },
            }
        }

        self.endpoint.close(0u32.into(), b"relay shutdown");
        info!("relay stopped");
        Ok(())
    }
}

async fn handle_connection(
    accepted: AcceptedConnection,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let AcceptedConnection {
        connection,
        remote_addr,
    } = accepted;
    info!(remote = %remote_addr, "transport connected");

    loop {
        let (send, recv) = tokio::select! {
            _ = shutdown.cancelled() => break,
            stream = connection.accept_bi() => match stream {
                Ok(pair) => pair,
                Err(e) => {
                    info!(remote = %remote_addr, reason = %e, "transport closed");
                    break;
                }
            },
        };

        let stream_id = next_stream_id();
        let shared = shared.clone();
        tokio::spawn(async move {
            let mut stream = RelayStream::new(stream_id, send, recv, shared.stream.clone());
            match stream.run(&shared.policy, &shared.dialer).await {
                Ok(summary) => debug!(
                    stream_id,
                    target = %summary.target,
                    closed_by = ?summary.closed_by,
                    bytes = summary.bytes,
                    active = shared.policy.active_streams(),
                    "stream finished"
                ),
                Err(failure) => warn!(remote = %remote_addr, error = %failure, "stream failed"),
            }
        });
    }
}
