//! Target policy: which `CONNECT` destinations the relay will dial, and how
//! many streams may relay at once.
//!
//! - [`TargetPolicy`] is the plain rule set, as loaded from config.
//! - [`PolicyEnforcer`] owns the rules plus the live stream counter.

use qbridge_core::ConnectHeader;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Destination rules.
///
/// `allow` entries take three forms:
///
/// | Pattern              | Matches                          |
/// |----------------------|----------------------------------|
/// | `"*"`                | any host and port                |
/// | `"db.internal"`      | that host on any port            |
/// | `"db.internal:5432"` | that host and port only          |
///
/// IPv6 literals use brackets when a port is given (`"[::1]:22"`). Host
/// comparison ignores ASCII case. An empty list denies everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPolicy {
    pub allow: Vec<String>,
    /// Concurrent relaying streams; `0` means unlimited.
    pub max_streams: usize,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            allow: vec!["*".to_string()],
            max_streams: 0,
        }
    }
}

pub struct PolicyEnforcer {
    max_streams: usize,
    allow_all: bool,
    hosts: HashSet<String>,
    host_ports: HashSet<(String, u16)>,
    active: Arc<AtomicUsize>,
}

impl PolicyEnforcer {
    pub fn new(policy: &TargetPolicy) -> Self {
        let mut allow_all = false;
        let mut hosts = HashSet::new();
        let mut host_ports = HashSet::new();
        for pattern in &policy.allow {
            match parse_pattern(pattern) {
                Pattern::Any => allow_all = true,
                Pattern::Host(host) => {
                    hosts.insert(host);
                }
                Pattern::HostPort(host, port) => {
                    host_ports.insert((host, port));
                }
            }
        }
        Self {
            max_streams: policy.max_streams,
            allow_all,
            hosts,
            host_ports,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Check the destination and reserve a stream slot.
    ///
    /// The returned guard keeps the slot until it is dropped.
    pub fn admit(&self, target: &ConnectHeader) -> Result<StreamGuard, String> {
        if !self.is_allowed(&target.host, target.port) {
            return Err(format!("destination not allowed: {target}"));
        }

        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        let guard = StreamGuard {
            counter: self.active.clone(),
        };
        if self.max_streams != 0 && now > self.max_streams {
            return Err(format!("stream limit reached ({})", self.max_streams));
        }
        debug!(active = now, "stream admitted");
        Ok(guard)
    }

    pub fn is_allowed(&self, host: &str, port: u16) -> bool {
        if self.allow_all {
            return true;
        }
        let host = normalize_host(host);
        self.hosts.contains(&host) || self.host_ports.contains(&(host, port))
    }

    /// Streams currently holding a slot.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Releases a stream slot on drop.
pub struct StreamGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

enum Pattern {
    Any,
    Host(String),
    HostPort(String, u16),
}

fn parse_pattern(pattern: &str) -> Pattern {
    let pattern = pattern.trim();
    if pattern == "*" {
        return Pattern::Any;
    }
    if let Some(rest) = pattern.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            if let Some(port) = tail.strip_prefix(':').and_then(|p| p.parse().ok()) {
                return Pattern::HostPort(normalize_host(host), port);
            }
            return Pattern::Host(normalize_host(host));
        }
    }
    // A bare IPv6 literal has several colons and no port.
    if pattern.matches(':').count() == 1 {
        if let Some((host, port)) = pattern.rsplit_once(':') {
            if let Ok(port) = port.parse() {
                return Pattern::HostPort(normalize_host(host), port);
            }
        }
    }
    Pattern::Host(normalize_host(pattern))
}

fn normalize_host(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}
