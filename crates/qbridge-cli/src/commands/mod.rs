//! CLI subcommand implementations.

pub mod cert;
pub mod client;
