//! QUIC listener.
//!
//! Accepts incoming QUIC connections and hands each completed handshake to the
//! server loop through a channel.

use qbridge_core::{TunnelError, TunnelResult};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A QUIC connection that finished its handshake.
pub struct AcceptedConnection {
    pub connection: quinn::Connection,
    pub remote_addr: SocketAddr,
}

/// Bind the endpoint and start accepting.
///
/// The returned receiver yields connections until the endpoint is closed.
pub fn start_listener(
    bind_addr: SocketAddr,
    server_config: quinn::ServerConfig,
) -> TunnelResult<(quinn::Endpoint, mpsc::Receiver<AcceptedConnection>)> {
    let endpoint = quinn::Endpoint::server(server_config, bind_addr)
        .map_err(|e| TunnelError::Config(format!("QUIC bind {bind_addr} failed: {e}")))?;

    info!(addr = %endpoint.local_addr()?, "QUIC listener started");

    let (tx, rx) = mpsc::channel::<AcceptedConnection>(64);
    let ep = endpoint.clone();

    tokio::spawn(async move {
        while let Some(incoming) = ep.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => {
                        let remote_addr = connection.remote_address();
                        debug!(remote = %remote_addr, "QUIC connection accepted");
                        let accepted = AcceptedConnection {
                            connection,
                            remote_addr,
                        };
                        if tx.send(accepted).await.is_err() {
                            debug!("server loop gone, dropping connection");
                        }
                    }
                    Err(e) => warn!(error = %e, "QUIC handshake failed"),
                }
            });
        }
        info!("QUIC endpoint closed, stopping listener");
    });

    Ok((endpoint, rx))
}
