//! Load node config from file and environment.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use zre_core::config::{
    DEFAULT_DISCOVERY_PORT, DEFAULT_EVASIVE_TIMEOUT, DEFAULT_EXPIRED_TIMEOUT, DEFAULT_INTERVAL,
    DEFAULT_PEER_HWM,
};

/// Node configuration. File: ~/.config/zre/config.toml or /etc/zre/config.toml.
/// Env overrides: ZRE_NAME, ZRE_DISCOVERY_PORT, ZRE_PORT, ZRE_INTERVAL_MS,
/// ZRE_EVASIVE_MS, ZRE_EXPIRED_MS, ZRE_LOG_ENDPOINT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Display name; defaults to the identity in hex.
    #[serde(default)]
    pub name: Option<String>,
    /// Headers announced in HELLO.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Discovery UDP port (default 5670).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Beacon destination (default 255.255.255.255).
    #[serde(default = "default_broadcast")]
    pub broadcast: Ipv4Addr,
    /// Local address for the data listener.
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,
    /// Data port; 0 picks a random port in 0xC000..=0xFFFF.
    #[serde(default)]
    pub port: u16,
    /// Host peers should dial; detected from the routing table when unset.
    #[serde(default)]
    pub advertised_host: Option<IpAddr>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_evasive_ms")]
    pub evasive_ms: u64,
    #[serde(default = "default_expired_ms")]
    pub expired_ms: u64,
    /// Outbound queue depth per peer, in messages.
    #[serde(default = "default_peer_hwm")]
    pub peer_hwm: usize,
    #[serde(default = "default_true")]
    pub beacons_enabled: bool,
    /// UDP destination for LOG records; none disables the log channel.
    #[serde(default)]
    pub log_endpoint: Option<SocketAddr>,
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_broadcast() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL.as_millis() as u64
}
fn default_evasive_ms() -> u64 {
    DEFAULT_EVASIVE_TIMEOUT.as_millis() as u64
}
fn default_expired_ms() -> u64 {
    DEFAULT_EXPIRED_TIMEOUT.as_millis() as u64
}
fn default_peer_hwm() -> usize {
    DEFAULT_PEER_HWM
}
fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            headers: BTreeMap::new(),
            discovery_port: default_discovery_port(),
            broadcast: default_broadcast(),
            bind_host: default_bind_host(),
            port: 0,
            advertised_host: None,
            interval_ms: default_interval_ms(),
            evasive_ms: default_evasive_ms(),
            expired_ms: default_expired_ms(),
            peer_hwm: default_peer_hwm(),
            beacons_enabled: true,
            log_endpoint: None,
        }
    }
}

impl NodeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Engine tunables derived from this config.
    pub fn engine_config(&self) -> zre_core::Config {
        zre_core::Config {
            evasive_timeout: Duration::from_millis(self.evasive_ms),
            expired_timeout: Duration::from_millis(self.expired_ms),
            beacons_enabled: self.beacons_enabled,
        }
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> NodeConfig {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Apply `ZRE_*` overrides; unparsable values are ignored.
pub fn apply_env(c: &mut NodeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("ZRE_NAME") {
        c.name = Some(s);
    }
    if let Some(p) = var("ZRE_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("ZRE_PORT").and_then(|s| s.parse().ok()) {
        c.port = p;
    }
    if let Some(ms) = var("ZRE_INTERVAL_MS").and_then(|s| s.parse().ok()) {
        c.interval_ms = ms;
    }
    if let Some(ms) = var("ZRE_EVASIVE_MS").and_then(|s| s.parse().ok()) {
        c.evasive_ms = ms;
    }
    if let Some(ms) = var("ZRE_EXPIRED_MS").and_then(|s| s.parse().ok()) {
        c.expired_ms = ms;
    }
    if let Some(addr) = var("ZRE_LOG_ENDPOINT").and_then(|s| s.parse().ok()) {
        c.log_endpoint = Some(addr);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/zre/config.toml"));
    }
    out.push(PathBuf::from("/etc/zre/config.toml"));
    out
}

fn load_file() -> Option<NodeConfig> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match NodeConfig::from_toml(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = NodeConfig::default();
        assert_eq!(c.discovery_port, 5670);
        assert_eq!(c.port, 0);
        assert_eq!(c.interval(), Duration::from_millis(1000));
        assert_eq!(c.engine_config().evasive_timeout, Duration::from_millis(5000));
        assert_eq!(c.engine_config().expired_timeout, Duration::from_millis(10000));
        assert_eq!(c.peer_hwm, 1000);
        assert!(c.beacons_enabled);
    }

    #[test]
    fn toml_fills_missing_fields_with_defaults() {
        let c = NodeConfig::from_toml(
            r#"
            name = "kitchen"
            discovery_port = 5999
            advertised_host = "192.168.1.20"
            log_endpoint = "192.168.1.1:5671"

            [headers]
            X-ROLE = "display"
            "#,
        )
        .unwrap();
        assert_eq!(c.name.as_deref(), Some("kitchen"));
        assert_eq!(c.discovery_port, 5999);
        assert_eq!(c.advertised_host, Some("192.168.1.20".parse().unwrap()));
        assert_eq!(c.log_endpoint, Some("192.168.1.1:5671".parse().unwrap()));
        assert_eq!(c.headers.get("X-ROLE").map(String::as_str), Some("display"));
        assert_eq!(c.expired_ms, 10000);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(NodeConfig::from_toml("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let mut c = NodeConfig::default();
        apply_env(&mut c, |key| match key {
            "ZRE_NAME" => Some("lab-3".into()),
            "ZRE_PORT" => Some("50123".into()),
            "ZRE_EVASIVE_MS" => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(c.name.as_deref(), Some("lab-3"));
        assert_eq!(c.port, 50123);
        assert_eq!(c.evasive_ms, 5000);
    }
}
