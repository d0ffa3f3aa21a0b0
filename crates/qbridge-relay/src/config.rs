//! Relay configuration: TOML file + CLI overrides.

use crate::policy::TargetPolicy;
use crate::stream::StreamSettings;
use qbridge_core::{QuicSettings, ServerTls, TunnelError, TunnelResult, DEFAULT_HEADER_LIMIT};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub quic: QuicSection,
}

/// `[relay]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelaySection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_header_limit")]
    pub header_limit: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            header_limit: default_header_limit(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// `[tls]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
    /// Require client certificates signed by this CA.
    #[serde(default)]
    pub client_ca: Option<String>,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            cert: default_cert_path(),
            key: default_key_path(),
            client_ca: None,
        }
    }
}

/// `[policy]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySection {
    #[serde(default = "default_allow")]
    pub allow: Vec<String>,
    #[serde(default)]
    pub max_streams: usize,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            allow: default_allow(),
            max_streams: 0,
        }
    }
}

/// `[timeouts]` section, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSection {
    #[serde(default = "default_timeout")]
    pub handshake: u64,
    #[serde(default = "default_timeout")]
    pub dial: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            handshake: default_timeout(),
            dial: default_timeout(),
        }
    }
}

/// `[quic]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuicSection {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Seconds between keep-alives; `0` disables them.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_max_bidi_streams")]
    pub max_bidi_streams: u32,
}

impl Default for QuicSection {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            keep_alive: default_keep_alive(),
            max_bidi_streams: default_max_bidi_streams(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:4433".to_string()
}
fn default_header_limit() -> usize {
    DEFAULT_HEADER_LIMIT
}
fn default_buffer_size() -> usize {
    16 * 1024
}
fn default_cert_path() -> String {
    "~/.qbridge/certs/server-cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.qbridge/certs/server-key.pem".to_string()
}
fn default_allow() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    30
}
fn default_keep_alive() -> u64 {
    10
}
fn default_max_bidi_streams() -> u32 {
    1000
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub client_ca: Option<String>,
    pub allow: Vec<String>,
    pub max_streams: Option<usize>,
    pub handshake_timeout: Option<u64>,
    pub dial_timeout: Option<u64>,
}

/// Resolved relay configuration (paths expanded, overrides applied).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub tls: ServerTls,
    pub policy: TargetPolicy,
    pub stream: StreamSettings,
    pub dial_timeout: Duration,
    pub quic: QuicSettings,
}

impl RelayConfig {
    /// Load config from a TOML file (if it exists), then apply overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> TunnelResult<Self> {
        let file = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| TunnelError::Config(format!("{}: {e}", path.display())))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file, overrides)
    }

    pub fn resolve(file: ConfigFile, overrides: Overrides) -> TunnelResult<Self> {
        let listen_str = overrides.listen.unwrap_or(file.relay.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|e| TunnelError::Config(format!("listen address {listen_str:?}: {e}")))?;

        let cert = overrides.cert.unwrap_or(file.tls.cert);
        let key = overrides.key.unwrap_or(file.tls.key);
        let client_ca = overrides.client_ca.or(file.tls.client_ca);

        let allow = if overrides.allow.is_empty() {
            file.policy.allow
        } else {
            overrides.allow
        };
        let max_streams = overrides.max_streams.unwrap_or(file.policy.max_streams);

        let handshake = overrides.handshake_timeout.unwrap_or(file.timeouts.handshake);
        let dial = overrides.dial_timeout.unwrap_or(file.timeouts.dial);
        if handshake == 0 || dial == 0 {
            return Err(TunnelError::Config("timeouts must be positive".into()));
        }
        if file.relay.header_limit == 0 || file.relay.buffer_size == 0 {
            return Err(TunnelError::Config(
                "header_limit and buffer_size must be positive".into(),
            ));
        }

        Ok(Self {
            listen,
            tls: ServerTls {
                cert: expand_tilde_str(&cert),
                key: expand_tilde_str(&key),
                client_ca: client_ca.as_deref().map(expand_tilde_str),
            },
            policy: TargetPolicy { allow, max_streams },
            stream: StreamSettings {
                header_limit: file.relay.header_limit,
                handshake_timeout: Duration::from_secs(handshake),
                buffer_size: file.relay.buffer_size,
            },
            dial_timeout: Duration::from_secs(dial),
            quic: QuicSettings {
                idle_timeout: Duration::from_secs(file.quic.idle_timeout),
                keep_alive_interval: match file.quic.keep_alive {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                max_bidi_streams: file.quic.max_bidi_streams,
            },
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = RelayConfig::load(None, Overrides::default()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:4433".parse().unwrap());
        assert_eq!(config.policy, TargetPolicy::default());
        assert_eq!(config.stream.header_limit, 1024);
        assert_eq!(config.stream.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.quic, QuicSettings::default());
        assert!(config.tls.client_ca.is_none());
        assert!(config.tls.cert.ends_with("server-cert.pem"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            RelayConfig::load(Some(&dir.path().join("absent.toml")), Overrides::default())
                .unwrap();
        assert_eq!(config.listen.port(), 4433);
    }

    #[test]
    fn file_values_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            r#"
[relay]
listen = "127.0.0.1:9000"
header_limit = 256

[tls]
cert = "/etc/qbridge/cert.pem"
key = "/etc/qbridge/key.pem"
client_ca = "/etc/qbridge/ca.pem"

[policy]
allow = ["db.internal:5432"]
max_streams = 50

[timeouts]
dial = 3

[quic]
keep_alive = 0
"#,
        )
        .unwrap();

        let config = RelayConfig::load(
            Some(&path),
            Overrides {
                listen: Some("127.0.0.1:9100".into()),
                max_streams: Some(5),
                ..Overrides::default()
            },
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.stream.header_limit, 256);
        assert_eq!(config.tls.cert, PathBuf::from("/etc/qbridge/cert.pem"));
        assert_eq!(
            config.tls.client_ca,
            Some(PathBuf::from("/etc/qbridge/ca.pem"))
        );
        assert_eq!(config.policy.allow, vec!["db.internal:5432".to_string()]);
        assert_eq!(config.policy.max_streams, 5);
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.stream.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.quic.keep_alive_interval, None);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let bad_listen = Overrides {
            listen: Some("nowhere".into()),
            ..Overrides::default()
        };
        assert!(matches!(
            RelayConfig::resolve(ConfigFile::default(), bad_listen),
            Err(TunnelError::Config(_))
        ));

        let zero_timeout = Overrides {
            dial_timeout: Some(0),
            ..Overrides::default()
        };
        assert!(matches!(
            RelayConfig::resolve(ConfigFile::default(), zero_timeout),
            Err(TunnelError::Config(_))
        ));

        assert!(toml::from_str::<ConfigFile>("[bogus]\n").is_err());
    }

    #[test]
    fn unknown_keys_inside_sections_are_rejected() {
        for file in [
            "[relay]\nbogus = 1\n",
            "[tls]\nclientca = \"/ca.pem\"\n",
            "[policy]\nmax_stream = 5\n",
            "[timeouts]\ndail = 3\n",
            "[quic]\nkeepalive = 0\n",
        ] {
            assert!(toml::from_str::<ConfigFile>(file).is_err(), "accepted {file:?}");
        }
        let policy: ConfigFile = toml::from_str("[policy]\nmax_streams = 5\n").unwrap();
        assert_eq!(policy.policy.max_streams, 5);
    }

    #[test]
    fn tilde_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x/y.pem"), home.join("x/y.pem"));
        }
        assert_eq!(expand_tilde_str("/abs/y.pem"), PathBuf::from("/abs/y.pem"));
    }
}
