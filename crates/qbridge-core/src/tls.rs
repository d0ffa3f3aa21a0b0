//! rustls configuration for both ends of the tunnel.
//!
//! The relay always presents a certificate and may require client
//! certificates signed by a configured CA. The client verifies the relay
//! against a CA file, or skips verification entirely in insecure mode.

use crate::error::{TunnelError, TunnelResult};
use crate::quic::ALPN;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::RootCertStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Relay-side certificate material.
#[derive(Debug, Clone)]
pub struct ServerTls {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// When set, clients must present a certificate signed by this CA.
    pub client_ca: Option<PathBuf>,
}

/// Client-side certificate material.
#[derive(Debug, Clone, Default)]
pub struct ClientTls {
    /// CA that signed the relay certificate.
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Accept any relay certificate. Development only.
    pub insecure: bool,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Read every certificate in a PEM file.
pub fn load_certs(path: &Path) -> TunnelResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| TunnelError::Tls(format!("cannot read cert {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Tls(format!("bad PEM in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(TunnelError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key in a PEM file.
pub fn load_private_key(path: &Path) -> TunnelResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| TunnelError::Tls(format!("cannot read key {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| TunnelError::Tls(format!("bad PEM in {}: {e}", path.display())))?
        .ok_or_else(|| TunnelError::Tls(format!("no private key found in {}", path.display())))
}

fn load_roots(path: &Path) -> TunnelResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Build the relay's TLS 1.3 config with the tunnel ALPN.
pub fn server_crypto(tls: &ServerTls) -> TunnelResult<rustls::ServerConfig> {
    let certs = load_certs(&tls.cert)?;
    let key = load_private_key(&tls.key)?;

    let builder = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?;

    let builder = match &tls.client_ca {
        Some(ca) => {
            let verifier = rustls::server::WebPkiClientVerifier::builder_with_provider(
                Arc::new(load_roots(ca)?),
                provider(),
            )
            .build()
            .map_err(|e| TunnelError::Tls(format!("client verifier: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder.with_single_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// Build the client's TLS 1.3 config with the tunnel ALPN.
pub fn client_crypto(tls: &ClientTls) -> TunnelResult<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?;

    let builder = if tls.insecure {
        warn!("relay certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider())))
    } else {
        let ca = tls.ca.as_deref().ok_or_else(|| {
            TunnelError::Config("no relay CA configured; set tls.ca or tls.insecure".into())
        })?;
        builder.with_root_certificates(load_roots(ca)?)
    };

    let mut config = match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => {
            builder.with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(TunnelError::Config(
                "client certificate and key must be given together".into(),
            ))
        }
    };
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
