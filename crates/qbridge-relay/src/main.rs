//! qbridge-relay: relay end of the qbridge tunnel.
//!
//! Accepts QUIC connections from qbridge clients and connects every stream to
//! the TCP target named in its `CONNECT` header.

use clap::Parser;
use qbridge_core::certs;
use qbridge_relay::config::{expand_tilde_str, Overrides};
use qbridge_relay::{RelayConfig, RelayServer};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// qbridge-relay: terminate tunnelled streams against their targets
#[derive(Parser, Debug)]
#[command(name = "qbridge-relay", version, about = "qbridge relay")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Require client certificates signed by this CA (PEM)
    #[arg(long)]
    client_ca: Option<String>,

    /// Allowed target pattern (`*`, `host` or `host:port`); repeatable
    #[arg(long = "allow")]
    allow: Vec<String>,

    /// Maximum concurrent relaying streams (0 = unlimited)
    #[arg(long)]
    max_streams: Option<usize>,

    /// Header read timeout in seconds
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Target dial timeout in seconds
    #[arg(long)]
    dial_timeout: Option<u64>,

    /// Config file path
    #[arg(long, default_value = "~/.qbridge/relay.toml")]
    config: String,

    /// Generate a development CA and certificates into ~/.qbridge/certs first
    #[arg(long)]
    generate_cert: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting qbridge-relay");

    let (mut cert, mut key) = (cli.cert, cli.key);
    if cli.generate_cert {
        match generate_dev_certs() {
            Ok(paths) => {
                info!(
                    cert = %paths.server_cert.display(),
                    ca = %paths.ca_cert.display(),
                    "generated development certificates"
                );
                cert = Some(paths.server_cert.to_string_lossy().into_owned());
                key = Some(paths.server_key.to_string_lossy().into_owned());
            }
            Err(e) => {
                error!(error = %e, "failed to generate certificates");
                std::process::exit(1);
            }
        }
    }

    let overrides = Overrides {
        listen: cli.listen,
        cert,
        key,
        client_ca: cli.client_ca,
        allow: cli.allow,
        max_streams: cli.max_streams,
        handshake_timeout: cli.handshake_timeout,
        dial_timeout: cli.dial_timeout,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match RelayConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = match RelayServer::bind(config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signal_token.cancel();
    });

    if let Err(e) = server.run(shutdown).await {
        error!(error = %e, "relay error");
        std::process::exit(1);
    }

    info!("qbridge-relay stopped");
}

/// Write a fresh CA, server and client certificate under `~/.qbridge/certs`.
fn generate_dev_certs() -> qbridge_core::TunnelResult<certs::PkiPaths> {
    let dir = expand_tilde_str("~/.qbridge/certs");
    let names = ["localhost".to_string(), "127.0.0.1".to_string(), "::1".to_string()];
    certs::generate_pki(&names, "qbridge-client")?.write_to(&dir, true)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
