//! qbridge-relay: terminates tunnelled QUIC streams.
//!
//! Each incoming stream names its destination with a `CONNECT` header; the
//! relay checks it against policy, dials it, and copies bytes both ways.

pub mod config;
pub mod dialer;
pub mod listener;
pub mod policy;
pub mod server;
pub mod stream;

pub use config::{Overrides, RelayConfig};
pub use dialer::TargetDialer;
pub use policy::{PolicyEnforcer, TargetPolicy};
pub use server::RelayServer;
pub use stream::{RelayStream, StreamSettings};
