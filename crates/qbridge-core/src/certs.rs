//! Development PKI: a CA plus a relay and a client certificate signed by it.

use crate::error::{TunnelError, TunnelResult};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use std::path::{Path, PathBuf};
use tracing::info;

pub const CA_CERT_FILE: &str = "ca-cert.pem";
pub const CA_KEY_FILE: &str = "ca-key.pem";
pub const SERVER_CERT_FILE: &str = "server-cert.pem";
pub const SERVER_KEY_FILE: &str = "server-key.pem";
pub const CLIENT_CERT_FILE: &str = "client-cert.pem";
pub const CLIENT_KEY_FILE: &str = "client-key.pem";

/// A certificate and its private key, both PEM encoded.
#[derive(Debug, Clone)]
pub struct PemPair {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct GeneratedPki {
    pub ca: PemPair,
    pub server: PemPair,
    pub client: PemPair,
}

/// Where [`GeneratedPki::write_to`] put each file.
#[derive(Debug, Clone)]
pub struct PkiPaths {
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

fn named(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

/// Generate a fresh CA and sign a server certificate (valid for
/// `server_names`, DNS names or IP literals) and a client certificate with it.
pub fn generate_pki(server_names: &[String], client_name: &str) -> TunnelResult<GeneratedPki> {
    if server_names.is_empty() {
        return Err(TunnelError::Config(
            "at least one server name is required".into(),
        ));
    }

    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.distinguished_name = named("qbridge CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let ca_key = KeyPair::generate()?;
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let mut server_params = CertificateParams::new(server_names.to_vec())?;
    server_params.distinguished_name = named(&server_names[0]);
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    server_params.use_authority_key_identifier_extension = true;
    let server_key = KeyPair::generate()?;
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key)?;

    let mut client_params = CertificateParams::new(vec![client_name.to_string()])?;
    client_params.distinguished_name = named(client_name);
    client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    client_params.use_authority_key_identifier_extension = true;
    let client_key = KeyPair::generate()?;
    let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key)?;

    Ok(GeneratedPki {
        ca: PemPair {
            cert: ca_cert.pem(),
            key: ca_key.serialize_pem(),
        },
        server: PemPair {
            cert: server_cert.pem(),
            key: server_key.serialize_pem(),
        },
        client: PemPair {
            cert: client_cert.pem(),
            key: client_key.serialize_pem(),
        },
    })
}

impl GeneratedPki {
    /// Write all six PEM files into `dir`, creating it if needed.
    ///
    /// Refuses to replace existing files unless `overwrite` is set.
    pub fn write_to(&self, dir: &Path, overwrite: bool) -> TunnelResult<PkiPaths> {
        std::fs::create_dir_all(dir)?;

        let paths = PkiPaths {
            ca_cert: dir.join(CA_CERT_FILE),
            ca_key: dir.join(CA_KEY_FILE),
            server_cert: dir.join(SERVER_CERT_FILE),
            server_key: dir.join(SERVER_KEY_FILE),
            client_cert: dir.join(CLIENT_CERT_FILE),
            client_key: dir.join(CLIENT_KEY_FILE),
        };

        let files = [
            (&paths.ca_cert, &self.ca.cert, false),
            (&paths.ca_key, &self.ca.key, true),
            (&paths.server_cert, &self.server.cert, false),
            (&paths.server_key, &self.server.key, true),
            (&paths.client_cert, &self.client.cert, false),
            (&paths.client_key, &self.client.key, true),
        ];

        if !overwrite {
            if let Some((existing, _, _)) = files.iter().find(|(path, _, _)| path.exists()) {
                return Err(TunnelError::Config(format!(
                    "{} already exists",
                    existing.display()
                )));
            }
        }

        for (path, contents, secret) in files {
            write_pem(path, contents, secret)?;
        }

        info!(dir = %dir.display(), "certificates written");
        Ok(paths)
    }
}

fn write_pem(path: &Path, contents: &str, secret: bool) -> TunnelResult<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if secret {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
    }
    #[cfg(not(unix))]
    let _ = secret;
    Ok(())
}
