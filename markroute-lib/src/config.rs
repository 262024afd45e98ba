//! Configuration snapshot: TOML schema, defaults and load-time validation.
//!
//! A [`Config`] is read once and then treated as immutable for the lifetime
//! of one service instance. The engine keeps the snapshot it started with
//! and cleans up exactly what that snapshot created, regardless of later
//! edits to the file on disk.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

pub const DEFAULT_PATH: &str = "/opt/etc/markroute/markroute.toml";
pub const ENV_VAR: &str = "MARKROUTE_CONFIG_PATH";

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found")]
    NoFile,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("invalid ipset name `{0}`: must match [a-z][a-z0-9_]*")]
    InvalidIpsetName(String),
    #[error("duplicate ipset name `{0}`")]
    DuplicateIpsetName(String),
    #[error("duplicate fwmark {0}")]
    DuplicateFwmark(u32),
    #[error("duplicate routing table {0}")]
    DuplicateTable(u32),
    #[error("duplicate rule priority {0}")]
    DuplicatePriority(u32),
    #[error("ipset `{ipset}` lists interface `{interface}` more than once")]
    DuplicateInterface { ipset: String, interface: String },
    #[error("ipset `{ipset}` references undeclared list `{list}`")]
    UnknownList { ipset: String, list: String },
    #[error("duplicate list name `{0}`")]
    DuplicateListName(String),
    #[error("list `{0}` must have either a url or inline entries")]
    EmptyListSource(String),
    #[error("ipset `{ipset}`: default gateway {gateway} does not match family {family}")]
    GatewayFamilyMismatch {
        ipset: String,
        gateway: IpAddr,
        family: Family,
    },
    #[error("ipset `{0}` has no interfaces and no default gateway")]
    NoEgress(String),
    #[error("invalid dns proxy address `{0}`: expected host:port")]
    InvalidDnsProxy(String),
}

/// Address family of an ipset and everything keyed to it (policy rule,
/// routes, iptables flavour).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            Family::Ipv4 => addr.is_ipv4(),
            Family::Ipv6 => addr.is_ipv6(),
        }
    }

    /// Family argument understood by the ipset helper binary.
    pub fn ipset_arg(&self) -> &'static str {
        match self {
            Family::Ipv4 => "inet",
            Family::Ipv6 => "inet6",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Ipv4 => write!(f, "ipv4"),
            Family::Ipv6 => write!(f, "ipv6"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub general: General,
    #[serde(default, rename = "list")]
    pub lists: Vec<ListSource>,
    #[serde(default, rename = "ipset")]
    pub ipsets: Vec<IpsetSpec>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct General {
    /// Directory the list store materializes downloaded lists into.
    pub lists_dir: PathBuf,
    /// Address of the downstream domain proxy, `host:port`. The port is
    /// the REDIRECT target of the global DNS rules; the host feeds the
    /// config fingerprint.
    #[serde(default = "default_dns_proxy")]
    pub dns_proxy: String,
    /// Install the global port-53 redirect chain.
    #[serde(default)]
    pub dns_redirect: bool,
    /// Routing reconciliation tick.
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
    /// Periodic list re-download; absent disables auto-update.
    #[serde(with = "humantime_serde", default)]
    pub update_interval: Option<Duration>,
    /// Router platform inventory endpoint; absent disables the inventory
    /// lookup and selection falls back to kernel link state alone.
    #[serde(default)]
    pub inventory_url: Option<url::Url>,
}

fn default_dns_proxy() -> String {
    "127.0.0.1:5353".to_string()
}

fn default_tick_interval() -> Duration {
    DEFAULT_TICK_INTERVAL
}

/// One ingestion list: a remote file or inline entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListSource {
    pub name: String,
    #[serde(default)]
    pub url: Option<url::Url>,
    #[serde(default)]
    pub entries: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpsetSpec {
    pub name: String,
    pub family: Family,
    #[serde(default)]
    pub lists: Vec<String>,
    #[serde(default)]
    pub flush_before_apply: bool,
    pub routing: RoutingSpec,
    /// Rule templates; when empty a mangle/PREROUTING MARK rule is
    /// synthesised (see the iptables module).
    #[serde(default, rename = "iptables_rule")]
    pub iptables_rules: Vec<IptablesRuleSpec>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingSpec {
    /// Candidate egress interfaces in preference order.
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Fallback next-hop when no listed interface is usable.
    #[serde(default)]
    pub default_gateway: Option<IpAddr>,
    pub fwmark: u32,
    pub table: u32,
    pub priority: u32,
    #[serde(default = "default_kill_switch")]
    pub kill_switch: bool,
}

fn default_kill_switch() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IptablesRuleSpec {
    #[serde(default = "default_iptables_table")]
    pub table: String,
    #[serde(default = "default_iptables_chain")]
    pub chain: String,
    pub rule: String,
}

fn default_iptables_table() -> String {
    "mangle".to_string()
}

fn default_iptables_chain() -> String {
    "PREROUTING".to_string()
}

impl General {
    /// Port the DNS redirect rules target.
    pub fn dns_proxy_port(&self) -> Result<u16, Error> {
        let (_, port) = split_host_port(&self.dns_proxy)
            .ok_or_else(|| Error::InvalidDnsProxy(self.dns_proxy.clone()))?;
        Ok(port)
    }

    /// Host part of the proxy address, for fingerprint resolution.
    pub fn dns_proxy_host(&self) -> Option<String> {
        split_host_port(&self.dns_proxy).map(|(host, _)| host)
    }
}

fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.trim_matches(['[', ']']).to_string(), port))
}

fn is_valid_ipset_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;

    let table = content.parse::<toml::Table>()?;
    for key in wrong_keys(&table) {
        tracing::warn!(%key, "ignoring unsupported key in configuration file");
    }

    let config: Config = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

/// Keys the schema does not know about; they are ignored with a warning
/// rather than rejected, so configs written for newer versions degrade
/// gracefully.
fn wrong_keys(table: &toml::Table) -> Vec<String> {
    const TOP_LEVEL: &[&str] = &["general", "list", "ipset"];
    const GENERAL: &[&str] = &[
        "lists_dir",
        "dns_proxy",
        "dns_redirect",
        "tick_interval",
        "update_interval",
        "inventory_url",
    ];

    let mut wrong = Vec::new();
    for key in table.keys() {
        if !TOP_LEVEL.contains(&key.as_str()) {
            wrong.push(key.clone());
        }
    }
    if let Some(toml::Value::Table(general)) = table.get("general") {
        for key in general.keys() {
            if !GENERAL.contains(&key.as_str()) {
                wrong.push(format!("general.{key}"));
            }
        }
    }
    wrong
}

/// Enforces the snapshot invariants. Runs at load; the engine relies on
/// them holding for its whole lifetime.
pub fn validate(config: &Config) -> Result<(), Error> {
    config.general.dns_proxy_port()?;

    let mut list_names = HashSet::new();
    for list in &config.lists {
        if !list_names.insert(list.name.as_str()) {
            return Err(Error::DuplicateListName(list.name.clone()));
        }
        if list.url.is_none() && list.entries.is_empty() {
            return Err(Error::EmptyListSource(list.name.clone()));
        }
    }

    let mut names = HashSet::new();
    let mut fwmarks = HashSet::new();
    let mut tables = HashSet::new();
    let mut priorities = HashSet::new();

    for ipset in &config.ipsets {
        if !is_valid_ipset_name(&ipset.name) {
            return Err(Error::InvalidIpsetName(ipset.name.clone()));
        }
        if !names.insert(ipset.name.as_str()) {
            return Err(Error::DuplicateIpsetName(ipset.name.clone()));
        }
        if !fwmarks.insert(ipset.routing.fwmark) {
            return Err(Error::DuplicateFwmark(ipset.routing.fwmark));
        }
        if !tables.insert(ipset.routing.table) {
            return Err(Error::DuplicateTable(ipset.routing.table));
        }
        if !priorities.insert(ipset.routing.priority) {
            return Err(Error::DuplicatePriority(ipset.routing.priority));
        }

        let mut interfaces = HashSet::new();
        for interface in &ipset.routing.interfaces {
            if !interfaces.insert(interface.as_str()) {
                return Err(Error::DuplicateInterface {
                    ipset: ipset.name.clone(),
                    interface: interface.clone(),
                });
            }
        }

        for list in &ipset.lists {
            if !list_names.contains(list.as_str()) {
                return Err(Error::UnknownList {
                    ipset: ipset.name.clone(),
                    list: list.clone(),
                });
            }
        }

        if let Some(gateway) = &ipset.routing.default_gateway
            && !ipset.family.matches(gateway)
        {
            return Err(Error::GatewayFamilyMismatch {
                ipset: ipset.name.clone(),
                gateway: *gateway,
                family: ipset.family,
            });
        }

        if ipset.routing.interfaces.is_empty() && ipset.routing.default_gateway.is_none() {
            return Err(Error::NoEgress(ipset.name.clone()));
        }
    }

    Ok(())
}
