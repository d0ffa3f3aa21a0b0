//! `qbridge client`: accept local TCP connections and tunnel them to the
//! relay until interrupted.

use anyhow::{Context, Result};
use qbridge_client::{ClientSettings, TunnelClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(settings: ClientSettings) -> Result<()> {
    let relay = settings.supervisor.relay_addr.clone();
    let target = settings.target.clone();
    let client = TunnelClient::bind(settings)
        .await
        .context("failed to start tunnel client")?;
    let listen = client.local_addr()?;

    println!("Tunnelling {listen} -> {relay} -> {target}");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signal_token.cancel();
    });

    client.run(shutdown).await?;
    Ok(())
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
