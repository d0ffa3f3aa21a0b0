//! TCP acceptance reactor.
//!
//! One acceptor task admits clients. Each client gets its own task that owns
//! the read half and waits for readability. The read itself happens under a
//! permit from a shared worker budget, so no more than `max_workers` reads are
//! in flight at once. The permit is released before the bytes are handed to
//! the bridge, so a backpressured stream only stalls its own connection.

use qbridge_core::bridge::{Bridge, BridgeFactory, ConnectionPeer};
use qbridge_core::{TunnelError, TunnelResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before accepting again after an accept error (e.g. out of file
/// descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub bind_addr: SocketAddr,
    /// Maximum bytes taken from a socket per read.
    pub buffer_size: usize,
    /// Reads allowed in flight across all connections.
    pub max_workers: usize,
}

impl ReactorConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            buffer_size: 16 * 1024,
            max_workers: 10,
        }
    }
}

pub struct ConnectionReactor {
    listener: TcpListener,
    buffer_size: usize,
    workers: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    next_conn_id: AtomicU64,
}

impl ConnectionReactor {
    pub async fn bind(config: ReactorConfig) -> TunnelResult<Self> {
        if config.buffer_size == 0 || config.max_workers == 0 {
            return Err(TunnelError::Config(
                "buffer_size and max_workers must be positive".into(),
            ));
        }
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "TCP listener bound");
        Ok(Self {
            listener,
            buffer_size: config.buffer_size,
            workers: Arc::new(Semaphore::new(config.max_workers)),
            active: Arc::new(AtomicUsize::new(0)),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> TunnelResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the live connection count.
    pub fn active_connections(&self) -> Arc<AtomicUsize> {
        self.active.clone()
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Cancelling also stops every connection task spawned by this reactor.
    pub async fn run(
        self,
        shutdown: CancellationToken,
        factory: Arc<dyn BridgeFactory>,
    ) -> TunnelResult<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.admit(stream, peer_addr, &shutdown, &factory),
                    Err(e) => {
                        warn!(error = %TunnelError::Accept(e.to_string()), "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
        info!("reactor stopped");
        Ok(())
    }

    fn admit(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        shutdown: &CancellationToken,
        factory: &Arc<dyn BridgeFactory>,
    ) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            warn!(conn_id, peer = %peer_addr, error = %e, "cannot configure socket, dropping");
            return;
        }

        let guard = ActiveGuard::new(conn_id, self.active.clone());
        let (reader, writer) = stream.into_split();
        let peer = ConnectionPeer {
            conn_id,
            peer_addr,
            writer,
            shutdown: shutdown.child_token(),
        };
        let conn = Connection {
            conn_id,
            reader,
            buffer: vec![0u8; self.buffer_size],
            workers: self.workers.clone(),
            _guard: guard,
        };
        let factory = factory.clone();
        tokio::spawn(conn.serve(peer, factory));
    }
}

/// Per-client state, owned by its task.
struct Connection {
    conn_id: u64,
    reader: OwnedReadHalf,
    buffer: Vec<u8>,
    workers: Arc<Semaphore>,
    _guard: ActiveGuard,
}

impl Connection {
    async fn serve(mut self, peer: ConnectionPeer, factory: Arc<dyn BridgeFactory>) {
        let conn_id = self.conn_id;
        let peer_addr = peer.peer_addr;
        let token = peer.shutdown.clone();

        // Bridge creation may open a stream and wait on the network, so it
        // runs here rather than on the acceptor.
        let mut bridge = tokio::select! {
            _ = token.cancelled() => return,
            created = factory.new_instance(peer) => match created {
                Ok(bridge) => bridge,
                Err(e) => {
                    warn!(conn_id, peer = %peer_addr, error = %e, "cannot bridge connection");
                    return;
                }
            },
        };

        match self.read_loop(bridge.as_mut(), &token).await {
            Ok(()) => debug!(conn_id, "client connection ended"),
            Err(e) => debug!(conn_id, error = %e, "client connection failed"),
        }

        if let Err(e) = bridge.close().await {
            debug!(conn_id, error = %e, "bridge close failed");
        }
        token.cancel();
    }

    async fn read_loop(
        &mut self,
        bridge: &mut dyn Bridge,
        token: &CancellationToken,
    ) -> TunnelResult<()> {
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                ready = self.reader.readable() => ready?,
            }

            let n = {
                let _permit = self
                    .workers
                    .acquire()
                    .await
                    .map_err(|_| TunnelError::Other("worker pool closed".into()))?;
                match self.reader.try_read(&mut self.buffer) {
                    Ok(0) => return Ok(()),
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            };

            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                written = bridge.write(&self.buffer[..n]) => written?,
            }
        }
    }
}

/// Counts a live client connection for as long as it is held.
struct ActiveGuard {
    conn_id: u64,
    active: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn new(conn_id: u64, active: Arc<AtomicUsize>) -> Self {
        let now = active.fetch_add(1, Ordering::Relaxed) + 1;
        info!(conn_id, active = now, "connection opened");
        Self { conn_id, active }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let now = self.active.fetch_sub(1, Ordering::Relaxed) - 1;
        info!(conn_id = self.conn_id, active = now, "connection closed");
    }
}
