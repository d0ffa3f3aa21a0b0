//! Wires the reactor, supervisor and tunnel factory into one runnable client.

use crate::reactor::{ConnectionReactor, ReactorConfig};
use crate::supervisor::{SupervisorConfig, TransportSupervisor};
use crate::tunnel::TunnelBridgeFactory;
use qbridge_core::{ClientTls, ConnectHeader, QuicSettings, TunnelResult};
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub reactor: ReactorConfig,
    pub supervisor: SupervisorConfig,
    /// Target every tunnelled connection is sent to.
    pub target: ConnectHeader,
    pub tls: ClientTls,
    pub quic: QuicSettings,
}

pub struct TunnelClient {
    reactor: ConnectionReactor,
    supervisor: Arc<TransportSupervisor>,
    factory: Arc<TunnelBridgeFactory>,
}

impl TunnelClient {
    /// Bind the TCP listener and prepare the transport. The relay is not
    /// contacted until the first client connects.
    pub async fn bind(settings: ClientSettings) -> TunnelResult<Self> {
        let supervisor = Arc::new(TransportSupervisor::new(
            settings.supervisor,
            &settings.tls,
            &settings.quic,
        )?);
        Self::with_supervisor(settings.reactor, supervisor, settings.target).await
    }

    pub async fn with_supervisor(
        reactor: ReactorConfig,
        supervisor: Arc<TransportSupervisor>,
        target: ConnectHeader,
    ) -> TunnelResult<Self> {
        let buffer_size = reactor.buffer_size;
        let reactor = ConnectionReactor::bind(reactor).await?;
        let factory = Arc::new(TunnelBridgeFactory::new(
            supervisor.clone(),
            target,
            buffer_size,
        ));
        Ok(Self {
            reactor,
            supervisor,
            factory,
        })
    }

    pub fn local_addr(&self) -> TunnelResult<SocketAddr> {
        self.reactor.local_addr()
    }

    pub fn supervisor(&self) -> &Arc<TransportSupervisor> {
        &self.supervisor
    }

    pub fn active_connections(&self) -> Arc<AtomicUsize> {
        self.reactor.active_connections()
    }

    /// Serve until `shutdown` is cancelled, then close the transport.
    pub async fn run(self, shutdown: CancellationToken) -> TunnelResult<()> {
        info!(
            listen = %self.local_addr()?,
            target = %self.factory.target(),
            "tunnel client running"
        );
        let result = self.reactor.run(shutdown, self.factory).await;
        self.supervisor.close().await;
        result
    }
}
