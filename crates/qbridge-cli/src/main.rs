//! qbridge: TCP over QUIC tunnel client.
//!
//! Runs the local side of the tunnel and provisions development
//! certificates for it and the relay.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use config::ClientFlags;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// qbridge: tunnel TCP connections over one shared QUIC connection
#[derive(Parser)]
#[command(
    name = "qbridge",
    version,
    about = "Tunnel TCP connections over a shared QUIC connection"
)]
struct Cli {
    /// Config file path (default: ~/.qbridge/client.toml)
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept TCP connections and tunnel each one to the relay
    Client {
        /// Local listen address (host:port)
        #[arg(short, long)]
        listen: Option<String>,

        /// Relay address (host:port)
        #[arg(short, long)]
        relay: Option<String>,

        /// Name the relay certificate must match (default: relay host)
        #[arg(long)]
        server_name: Option<String>,

        /// Destination the relay connects to (host:port)
        #[arg(short, long)]
        target: Option<String>,

        /// CA certificate that signed the relay certificate (PEM)
        #[arg(long)]
        ca: Option<String>,

        /// Client certificate for mutual TLS (PEM)
        #[arg(long)]
        cert: Option<String>,

        /// Client private key for mutual TLS (PEM)
        #[arg(long)]
        key: Option<String>,

        /// Skip relay certificate verification (development only)
        #[arg(long)]
        insecure: bool,
    },

    /// Generate a CA plus relay and client certificates
    Cert {
        /// Output directory
        #[arg(short, long, default_value = "certs")]
        out: PathBuf,

        /// DNS name or IP the relay certificate is valid for; repeatable
        #[arg(long = "server-name", default_values = ["localhost", "127.0.0.1"])]
        server_names: Vec<String>,

        /// Common name of the client certificate
        #[arg(long, default_value = "qbridge-client")]
        client_name: String,

        /// Replace existing files
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Client {
            listen,
            relay,
            server_name,
            target,
            ca,
            cert,
            key,
            insecure,
        } => {
            let config_path = cli.config.unwrap_or_else(config::default_path);
            let flags = ClientFlags {
                listen,
                relay,
                server_name,
                target,
                ca,
                cert,
                key,
                insecure,
            };
            match config::Config::load(&config_path).and_then(|cfg| cfg.resolve(flags)) {
                Ok(settings) => commands::client::run(settings).await,
                Err(e) => Err(e),
            }
        }
        Command::Cert {
            out,
            server_names,
            client_name,
            force,
        } => commands::cert::run(&out, &server_names, &client_name, force),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("qbridge: {e:#}");
        std::process::exit(1);
    }
}
