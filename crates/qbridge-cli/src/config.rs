//! Client configuration at `~/.qbridge/client.toml`.
//!
//! CLI flags always override config file values.

use anyhow::{bail, Context, Result};
use qbridge_client::{ClientSettings, ReactorConfig, SupervisorConfig};
use qbridge_core::{ClientTls, ConnectHeader, QuicSettings};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub quic: QuicSection,
}

/// `[client]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Relay as `host:port`.
    #[serde(default)]
    pub relay: Option<String>,
    /// Name checked against the relay certificate; defaults to the relay host.
    #[serde(default)]
    pub server_name: Option<String>,
    /// Destination as `host:port`, sent in every `CONNECT` header.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            relay: None,
            server_name: None,
            target: None,
            buffer_size: default_buffer_size(),
            max_workers: default_max_workers(),
        }
    }
}

/// `[tls]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

/// `[timeouts]` section, in seconds except where noted.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSection {
    #[serde(default = "default_timeout")]
    pub connect: u64,
    #[serde(default = "default_timeout")]
    pub open: u64,
    /// Milliseconds between reconnect attempts; `0` disables the delay.
    #[serde(default)]
    pub reconnect_backoff_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect: default_timeout(),
            open: default_timeout(),
            reconnect_backoff_ms: 0,
        }
    }
}

/// `[quic]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuicSection {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
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
    "127.0.0.1:1080".to_string()
}
fn default_buffer_size() -> usize {
    16 * 1024
}
fn default_max_workers() -> usize {
    10
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

/// `qbridge client` flags that can override the file.
#[derive(Debug, Clone, Default)]
pub struct ClientFlags {
    pub listen: Option<String>,
    pub relay: Option<String>,
    pub server_name: Option<String>,
    pub target: Option<String>,
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub insecure: bool,
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Merge flags over the file and validate the result.
    pub fn resolve(self, flags: ClientFlags) -> Result<ClientSettings> {
        let listen_str = flags.listen.unwrap_or(self.client.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .with_context(|| format!("invalid listen address '{listen_str}'"))?;

        let Some(relay) = flags.relay.or(self.client.relay) else {
            bail!("no relay address; pass --relay or set client.relay");
        };
        let (relay_host, _) = split_host_port(&relay)
            .with_context(|| format!("invalid relay address '{relay}'"))?;
        let server_name = flags
            .server_name
            .or(self.client.server_name)
            .unwrap_or(relay_host);

        let Some(target) = flags.target.or(self.client.target) else {
            bail!("no target; pass --target or set client.target");
        };
        let (target_host, target_port) = split_host_port(&target)
            .with_context(|| format!("invalid target '{target}'"))?;

        if self.timeouts.connect == 0 || self.timeouts.open == 0 {
            bail!("timeouts must be positive");
        }

        let mut reactor = ReactorConfig::new(listen);
        reactor.buffer_size = self.client.buffer_size;
        reactor.max_workers = self.client.max_workers;

        let mut supervisor = SupervisorConfig::new(relay, server_name);
        supervisor.connect_timeout = Duration::from_secs(self.timeouts.connect);
        supervisor.open_timeout = Duration::from_secs(self.timeouts.open);
        supervisor.reconnect_backoff = match self.timeouts.reconnect_backoff_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(ClientSettings {
            reactor,
            supervisor,
            target: ConnectHeader::new(target_host, target_port),
            tls: ClientTls {
                ca: flags.ca.or(self.tls.ca).map(|p| expand_tilde(&p)),
                cert: flags.cert.or(self.tls.cert).map(|p| expand_tilde(&p)),
                key: flags.key.or(self.tls.key).map(|p| expand_tilde(&p)),
                insecure: flags.insecure || self.tls.insecure,
            },
            quic: QuicSettings {
                idle_timeout: Duration::from_secs(self.quic.idle_timeout),
                keep_alive_interval: match self.quic.keep_alive {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                max_bidi_streams: self.quic.max_bidi_streams,
            },
        })
    }
}

/// Default config location, `~/.qbridge/client.toml`.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".qbridge")
        .join("client.toml")
}

/// Split `host:port`, accepting `[v6]:port`. The port must be `1..=65535`.
pub fn split_host_port(s: &str) -> Result<(String, u16)> {
    let Some((host, port)) = s.rsplit_once(':') else {
        bail!("expected host:port");
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("empty host");
    }
    let port: u16 = port.parse().with_context(|| format!("invalid port '{port}'"))?;
    if port == 0 {
        bail!("port must be non-zero");
    }
    Ok((host.to_string(), port))
}

fn expand_tilde(s: &str) -> PathBuf {
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

    fn flags(relay: &str, target: &str) -> ClientFlags {
        ClientFlags {
            relay: Some(relay.into()),
            target: Some(target.into()),
            ..ClientFlags::default()
        }
    }

    #[test]
    fn split_host_port_forms() {
        assert_eq!(
            split_host_port("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(split_host_port("[::1]:22").unwrap(), ("::1".to_string(), 22));
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port(":80").is_err());
        assert!(split_host_port("host:0").is_err());
        assert!(split_host_port("host:99999").is_err());
    }

    #[test]
    fn resolve_defaults() {
        let settings = Config::default()
            .resolve(flags("relay.example:4433", "127.0.0.1:22"))
            .unwrap();
        assert_eq!(settings.reactor.bind_addr, "127.0.0.1:1080".parse().unwrap());
        assert_eq!(settings.reactor.max_workers, 10);
        assert_eq!(settings.supervisor.relay_addr, "relay.example:4433");
        assert_eq!(settings.supervisor.server_name, "relay.example");
        assert_eq!(settings.supervisor.reconnect_backoff, None);
        assert_eq!(settings.target, ConnectHeader::new("127.0.0.1", 22));
        assert_eq!(settings.quic, QuicSettings::default());
        assert!(!settings.tls.insecure);
    }

    #[test]
    fn relay_and_target_are_required() {
        let err = Config::default()
            .resolve(ClientFlags {
                target: Some("a:1".into()),
                ..ClientFlags::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("relay"));

        let err = Config::default()
            .resolve(ClientFlags {
                relay: Some("a:1".into()),
                ..ClientFlags::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("target"));
    }

    #[test]
    fn file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(
            &path,
            r#"
[client]
listen = "127.0.0.1:2222"
relay = "relay.example:4433"
server_name = "tunnel.example"
target = "db.internal:5432"
max_workers = 4

[tls]
ca = "/etc/qbridge/ca-cert.pem"

[timeouts]
connect = 3
reconnect_backoff_ms = 500
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let settings = config
            .resolve(ClientFlags {
                target: Some("db.internal:6543".into()),
                insecure: true,
                ..ClientFlags::default()
            })
            .unwrap();

        assert_eq!(settings.reactor.bind_addr.port(), 2222);
        assert_eq!(settings.reactor.max_workers, 4);
        assert_eq!(settings.supervisor.server_name, "tunnel.example");
        assert_eq!(settings.supervisor.connect_timeout, Duration::from_secs(3));
        assert_eq!(
            settings.supervisor.reconnect_backoff,
            Some(Duration::from_millis(500))
        );
        assert_eq!(settings.target, ConnectHeader::new("db.internal", 6543));
        assert_eq!(
            settings.tls.ca,
            Some(PathBuf::from("/etc/qbridge/ca-cert.pem"))
        );
        assert!(settings.tls.insecure);
    }

    #[test]
    fn missing_file_is_default_and_bad_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert!(config.client.relay.is_none());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[nonsense]\n").unwrap();
        assert!(Config::load(&bad).is_err());
    }

    #[test]
    fn unknown_keys_inside_sections_are_rejected() {
        for file in [
            "[client]\nmax_worker = 4\n",
            "[tls]\ninsecur = true\n",
            "[timeouts]\nreconnect_backoff = 500\n",
            "[quic]\nidle = 5\n",
        ] {
            assert!(toml::from_str::<Config>(file).is_err(), "accepted {file:?}");
        }
    }
}
