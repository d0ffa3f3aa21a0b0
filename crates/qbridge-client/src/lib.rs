//! qbridge-client: tunnels local TCP connections to a relay over one shared
//! QUIC connection, one stream per TCP connection.

pub mod client;
pub mod reactor;
pub mod supervisor;
pub mod tunnel;

pub use client::{ClientSettings, TunnelClient};
pub use reactor::{ConnectionReactor, ReactorConfig};
pub use supervisor::{SupervisorConfig, TransportSupervisor};
pub use tunnel::{TunnelBridge, TunnelBridgeFactory};
