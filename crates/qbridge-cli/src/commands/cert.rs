//! `qbridge cert`: generate a development CA plus relay and client
//! certificates signed by it.

use anyhow::{Context, Result};
use qbridge_core::certs;
use std::path::Path;
use tracing::info;

pub fn run(out: &Path, server_names: &[String], client_name: &str, force: bool) -> Result<()> {
    let pki = certs::generate_pki(server_names, client_name)
        .context("failed to generate certificates")?;
    let paths = pki
        .write_to(out, force)
        .with_context(|| format!("failed to write certificates to {}", out.display()))?;

    info!(dir = %out.display(), names = ?server_names, "certificates generated");

    println!("Generated certificates in {}", out.display());
    println!("  CA:     {}", paths.ca_cert.display());
    println!("  Relay:  {} ({})", paths.server_cert.display(), server_names.join(", "));
    println!("  Client: {} ({client_name})", paths.client_cert.display());

    Ok(())
}
