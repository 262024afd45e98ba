//! Abstraction over iptables operations for testability.
//!
//! Defines the [`IptablesOps`] trait mirroring the `iptables` crate API,
//! plus the packet-marking rule templating. Production code uses
//! [`RealIptablesOps`]; tests use stateful mocks (see the `mocks` module).

use thiserror::Error;

use std::sync::Arc;

use crate::config::{Family, IpsetSpec};

/// Dedicated nat chain holding the global DNS redirect rules.
pub const DNS_CHAIN: &str = "KEEN_PBR_DNS";

/// Rule synthesised for an ipset that configures no templates: stamp the
/// fwmark on not-yet-marked packets matching the set in either direction.
pub const DEFAULT_MARK_RULE: &str =
    "-m mark --mark 0x0/0xffffffff -m set --match-set {{ipset_name}} dst,src -j MARK --set-mark {{fwmark}}";

const DEFAULT_MARK_TABLE: &str = "mangle";
const DEFAULT_MARK_CHAIN: &str = "PREROUTING";

#[derive(Debug, Error)]
pub enum Error {
    #[error("iptables unavailable: {0}")]
    Unavailable(String),
    #[error("iptables error: {0}")]
    Backend(String),
}

/// A fully templated rule ready to hand to the helper.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedRule {
    pub table: String,
    pub chain: String,
    pub rule: String,
}

/// Substitute the ipset placeholders into a rule template. The fwmark is
/// rendered in decimal.
pub fn render_rule(template: &str, spec: &IpsetSpec) -> String {
    template
        .replace("{{ipset_name}}", &spec.name)
        .replace("{{fwmark}}", &spec.routing.fwmark.to_string())
        .replace("{{table}}", &spec.routing.table.to_string())
        .replace("{{priority}}", &spec.routing.priority.to_string())
}

/// The packet-marking rules for one ipset: its configured templates, or
/// the synthesised default when none are configured.
pub fn mark_rules(spec: &IpsetSpec) -> Vec<RenderedRule> {
    if spec.iptables_rules.is_empty() {
        return vec![RenderedRule {
            table: DEFAULT_MARK_TABLE.to_string(),
            chain: DEFAULT_MARK_CHAIN.to_string(),
            rule: render_rule(DEFAULT_MARK_RULE, spec),
        }];
    }
    spec.iptables_rules
        .iter()
        .map(|t| RenderedRule {
            table: t.table.clone(),
            chain: t.chain.clone(),
            rule: render_rule(&t.rule, spec),
        })
        .collect()
}

// ============================================================================
// Trait
// ============================================================================

/// Abstraction over iptables chain and rule operations.
///
/// All methods are synchronous, matching the underlying `iptables` crate;
/// the family selects between the v4 and v6 flavour of the helper.
pub trait IptablesOps: Send + Sync {
    fn chain_exists(&self, family: Family, table: &str, chain: &str) -> Result<bool, Error>;
    fn new_chain(&self, family: Family, table: &str, chain: &str) -> Result<(), Error>;
    fn flush_chain(&self, family: Family, table: &str, chain: &str) -> Result<(), Error>;
    fn delete_chain(&self, family: Family, table: &str, chain: &str) -> Result<(), Error>;
    fn append(&self, family: Family, table: &str, chain: &str, rule: &str) -> Result<(), Error>;
    fn insert(&self, family: Family, table: &str, chain: &str, rule: &str, position: i32) -> Result<(), Error>;
    fn delete(&self, family: Family, table: &str, chain: &str, rule: &str) -> Result<(), Error>;
    fn exists(&self, family: Family, table: &str, chain: &str, rule: &str) -> Result<bool, Error>;
    fn list(&self, family: Family, table: &str, chain: &str) -> Result<Vec<String>, Error>;
}

// ============================================================================
// Real Implementation
// ============================================================================

struct Inner {
    v4: iptables::IPTables,
    v6: iptables::IPTables,
}

/// Production [`IptablesOps`] backed by the `iptables` crate.
#[derive(Clone)]
pub struct RealIptablesOps {
    inner: Arc<Inner>,
}

impl RealIptablesOps {
    pub fn new() -> Result<Self, Error> {
        let v4 = iptables::new(false).map_err(|e| Error::Unavailable(e.to_string()))?;
        let v6 = iptables::new(true).map_err(|e| Error::Unavailable(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner { v4, v6 }),
        })
    }

    fn flavour(&self, family: Family) -> &iptables::IPTables {
        match family {
            Family::Ipv4 => &self.inner.v4,
            Family::Ipv6 => &self.inner.v6,
        }
    }
}

impl IptablesOps for RealIptablesOps {
    fn chain_exists(&self, family: Family, table: &str, chain: &str) -> Result<bool, Error> {
        self.flavour(family)
            .chain_exists(table, chain)
            .map_err(|e| Error::Backend(e.to_string()))
    }

    fn new_chain(&self, family: Family, table: &str, chain: &str) -> Result<(), Error> {
        self.flavour(family)
            .new_chain(table, chain)
            .map_err(|e| Error::Backend(e.to_string()))
    }

    fn flush_chain(&self, family: Family, table: &str, chain: &str) -> Result<(), Error> {
        self.flavour(family)
            .flush_chain(table, chain)
            .map_err(|e| Error::Backend(e.to_string()))
    }

    fn delete_chain(&self, family: Family, table: &str, chain: &str) -> Result<(), Error> {
        self.flavour(family)
            .delete_chain(table, chain)
            .map_err(|e| Error::Backend(e.to_string()))
    }

    fn append(&self, family: Family, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        self.flavour(family)
            .append(table, chain, rule)
            .map_err(|e| Error::Backend(e.to_string()))
    }

    fn insert(&self, family: Family, table: &str, chain: &str, rule: &str, position: i32) -> Result<(), Error> {
        self.flavour(family)
            .insert(table, chain, rule, position)
            .map_err(|e| Error::Backend(e.to_string()))
    }

    fn delete(&self, family: Family, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        self.flavour(family)
            .delete(table, chain, rule)
            .map_err(|e| Error::Backend(e.to_string()))
    }

    fn exists(&self, family: Family, table: &str, chain: &str, rule: &str) -> Result<bool, Error> {
        self.flavour(family)
            .exists(table, chain, rule)
            .map_err(|e| Error::Backend(e.to_string()))
    }

    fn list(&self, family: Family, table: &str, chain: &str) -> Result<Vec<String>, Error> {
        self.flavour(family)
            .list(table, chain)
            .map_err(|e| Error::Backend(e.to_string()))
    }
}
