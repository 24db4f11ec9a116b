//! Configuration module for Flora
//!
//! JSON document with Surge-style rule lines. Loading only parses; the
//! `build_*` methods turn the document into the runtime's immutable rule set
//! and proxy registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::MAX_TTL;
use crate::error::{Error, Result};
use crate::router::RuleSet;
use crate::transport::Transport;
use crate::upstream::{Group, ProxyRegistry, ShadowsocksConnector, Upstream};

pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Upstreams by name
    #[serde(default)]
    pub proxies: BTreeMap<String, ProxyConfig>,

    /// Groups by name
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,

    /// Surge-style rule lines, in evaluation order per category
    #[serde(default)]
    pub rules: Vec<String>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file {:?}: {}", path, e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Local listening address
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.general.listen_ip(), self.general.socks_port)
    }

    /// `skip_proxy` followed by `bypass_tun`, order preserved
    pub fn bypass_list(&self) -> Vec<String> {
        self.general
            .skip_proxy
            .iter()
            .chain(&self.general.bypass_tun)
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect()
    }

    /// Build the rule set. Unknown rule types are an error.
    pub fn build_rules(&self) -> Result<RuleSet> {
        let mut rules = RuleSet::new();
        rules.add_bypass(self.bypass_list());
        for line in &self.rules {
            rules.add_line(line)?;
        }
        debug!(
            "Loaded {} rules and {} bypass entries",
            rules.len(),
            rules.bypass.len()
        );
        Ok(rules)
    }

    /// Build upstreams and groups. Invalid proxies and unknown group members
    /// are skipped with a warning.
    pub fn build_registry(&self, transport: Arc<dyn Transport>) -> Result<ProxyRegistry> {
        let mut registry = ProxyRegistry::new(Arc::clone(&transport));

        for (name, proxy) in &self.proxies {
            match proxy.build(name, Arc::clone(&transport)) {
                Ok(upstream) => {
                    debug!("Loaded proxy [{}] ({})", upstream.name(), upstream.kind().name());
                    registry.add_upstream(upstream);
                }
                Err(e) => warn!("Skipping proxy [{}]: {}", name, e),
            }
        }

        for (name, group) in &self.groups {
            let members: Vec<_> = group
                .members
                .iter()
                .filter_map(|member| {
                    let upstream = registry.upstream(member);
                    if upstream.is_none() {
                        warn!("Group [{}] member [{}] is not a known proxy, skipped", name, member);
                    }
                    upstream
                })
                .collect();
            if members.is_empty() {
                warn!("Group [{}] has no usable members", name);
            }
            registry.add_group(Group::new(name, &group.mode, members));
        }

        Ok(registry)
    }
}

/// Log configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// trace, debug, info, warn, error. Overrides RUST_LOG when set.
    #[serde(default)]
    pub level: Option<String>,
}

/// `[General]` settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Listen host; used only if it is an IP literal
    #[serde(default)]
    pub interface: Option<String>,

    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    #[serde(default)]
    pub skip_proxy: Vec<String>,

    #[serde(default)]
    pub bypass_tun: Vec<String>,

    /// Point the OS proxy settings at the listener while running
    #[serde(default)]
    pub system_proxy: bool,
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

impl GeneralConfig {
    fn listen_ip(&self) -> IpAddr {
        self.interface
            .as_deref()
            .and_then(|host| host.trim().parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            interface: None,
            socks_port: DEFAULT_SOCKS_PORT,
            skip_proxy: Vec::new(),
            bypass_tun: Vec::new(),
            system_proxy: false,
        }
    }
}

/// Resolution Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    #[serde(default = "default_geoip_ttl_secs")]
    pub geoip_ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_ttl_secs() -> u64 {
    crate::cache::DEFAULT_TTL.as_secs()
}

fn default_geoip_ttl_secs() -> u64 {
    crate::geoip::DEFAULT_GEOIP_TTL.as_secs()
}

fn default_sweep_interval_secs() -> u64 {
    crate::cache::DEFAULT_SWEEP_INTERVAL.as_secs()
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs).min(MAX_TTL)
    }

    pub fn geoip_ttl(&self) -> Duration {
        Duration::from_secs(self.geoip_ttl_secs).min(MAX_TTL)
    }

    /// Never zero, `tokio::time::interval` panics on it
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            geoip_ttl_secs: default_geoip_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Upstream type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ProxyType {
    Shadowsocks,
    Direct,
    Reject,
}

/// Case-insensitive; `custom` and `ss` name a Shadowsocks server
impl TryFrom<String> for ProxyType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "shadowsocks" | "custom" | "ss" => Ok(Self::Shadowsocks),
            "direct" => Ok(Self::Direct),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown proxy type `{}`", other)),
        }
    }
}

/// One `[Proxy]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,

    #[serde(default)]
    pub server: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    /// Cipher name, e.g. `aes-256-gcm`
    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    fn build(&self, name: &str, transport: Arc<dyn Transport>) -> Result<Upstream> {
        match self.proxy_type {
            ProxyType::Direct => Ok(Upstream::direct(name, transport)),
            ProxyType::Reject => Ok(Upstream::reject(name)),
            ProxyType::Shadowsocks => {
                let missing = |field: &str| Error::Config(format!("missing `{}`", field));
                let server = self.server.as_deref().ok_or_else(|| missing("server"))?;
                let port = self.port.ok_or_else(|| missing("port"))?;
                let method = self.method.as_deref().ok_or_else(|| missing("method"))?;
                let password = self.password.as_deref().ok_or_else(|| missing("password"))?;

                let connector = ShadowsocksConnector::new(server, port, method, password)?;
                Ok(Upstream::tunnel(name, Arc::new(connector)))
            }
        }
    }
}

/// One `[Proxy Group]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// `select` (ordered first-eligible) or `random`
    #[serde(default = "default_group_mode")]
    pub mode: String,

    pub members: Vec<String>,
}

fn default_group_mode() -> String {
    "select".to_string()
}
