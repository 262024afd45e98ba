//! The component abstraction: every managed kernel object knows whether it
//! currently exists, whether it should exist under current conditions, and
//! how to converge the two.
//!
//! Components are a closed set of variants: the set of kernel object
//! kinds is fixed and exhaustiveness checks matter when one is added.
//! They carry only data; the kernel accessors are passed in through
//! [`Ops`], which keeps builders pure and lets tests substitute the whole
//! substrate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::sync::Arc;

use crate::config::{Family, IpsetSpec};
use crate::inventory::InventoryOps;
use crate::iptables::{self, IptablesOps, RenderedRule, DNS_CHAIN};
use crate::ipset::{self, IpsetOps};
use crate::netlink::{self, NetlinkOps, RouteSpec, RuleSpec};
use crate::selector;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Ipset(#[from] ipset::Error),
    #[error(transparent)]
    Netlink(#[from] netlink::Error),
    #[error(transparent)]
    Iptables(#[from] iptables::Error),
}

/// Kernel accessors handed to every component operation.
#[derive(Clone)]
pub struct Ops<N, S, F, V> {
    pub netlink: N,
    pub ipset: S,
    pub iptables: F,
    pub inventory: Option<V>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Ipset,
    IpRule,
    IpRoute,
    Iptables,
    DnsRedirect,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CheckStatus {
    Ok,
    Missing,
    Unexpected,
    Error(String),
}

/// One line of a self-check report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckReport {
    pub kind: ComponentKind,
    /// Owning ipset, empty for global components.
    pub ipset: String,
    pub description: String,
    pub status: CheckStatus,
}

#[derive(Clone, Debug)]
pub enum Component {
    /// The named kernel address set itself.
    Ipset { spec: Arc<IpsetSpec> },
    /// Policy rule: fwmark → table at priority.
    IpRule { spec: Arc<IpsetSpec> },
    /// One packet-marking rule of an ipset.
    Iptables { spec: Arc<IpsetSpec>, rule: RenderedRule },
    /// The custom routing table of an ipset, taken as a whole. Creation
    /// establishes the blackhole fallback; the routing reconciler owns
    /// the egress routes on top of it.
    IpRoute { spec: Arc<IpsetSpec> },
    /// Global port-53 redirect chain, outside any ipset.
    DnsRedirect { proxy_port: u16 },
}

/// Whether an ipset currently has any egress at all: a usable listed
/// interface or a configured fallback gateway. Errors while probing keep
/// the persistent config in place rather than tearing it down on a
/// transient netlink failure.
pub(crate) async fn egress_available<N, V>(netlink: &N, inventory: Option<&V>, spec: &IpsetSpec) -> bool
where
    N: NetlinkOps,
    V: InventoryOps,
{
    if spec.routing.default_gateway.is_some() {
        return true;
    }
    match selector::choose_interface(netlink, inventory, spec).await {
        Ok(choice) => choice.is_some(),
        Err(error) => {
            tracing::warn!(ipset = %spec.name, %error, "egress probe failed, assuming available");
            true
        }
    }
}

impl Component {
    pub fn kind(&self) -> ComponentKind {
        match self {
            Component::Ipset { .. } => ComponentKind::Ipset,
            Component::IpRule { .. } => ComponentKind::IpRule,
            Component::Iptables { .. } => ComponentKind::Iptables,
            Component::IpRoute { .. } => ComponentKind::IpRoute,
            Component::DnsRedirect { .. } => ComponentKind::DnsRedirect,
        }
    }

    /// Owning ipset name; empty for global components.
    pub fn ipset_name(&self) -> &str {
        match self {
            Component::Ipset { spec }
            | Component::IpRule { spec }
            | Component::Iptables { spec, .. }
            | Component::IpRoute { spec } => &spec.name,
            Component::DnsRedirect { .. } => "",
        }
    }

    pub fn description(&self) -> String {
        match self {
            Component::Ipset { spec } => format!("ipset {} ({})", spec.name, spec.family),
            Component::IpRule { spec } => format!(
                "ip rule fwmark {} lookup {} priority {}",
                spec.routing.fwmark, spec.routing.table, spec.routing.priority
            ),
            Component::Iptables { rule, .. } => {
                format!("iptables -t {} -A {} {}", rule.table, rule.chain, rule.rule)
            }
            Component::IpRoute { spec } => format!("routing table {}", spec.routing.table),
            Component::DnsRedirect { proxy_port } => {
                format!("dns redirect chain {DNS_CHAIN} to port {proxy_port}")
            }
        }
    }

    fn rule_spec(spec: &IpsetSpec) -> RuleSpec {
        RuleSpec {
            family: spec.family,
            fwmark: spec.routing.fwmark,
            table: spec.routing.table,
            priority: spec.routing.priority,
        }
    }

    /// Probe current kernel state; read-only.
    pub async fn is_exists<N, S, F, V>(&self, ops: &Ops<N, S, F, V>) -> Result<bool, Error>
    where
        N: NetlinkOps,
        S: IpsetOps,
        F: IptablesOps,
        V: InventoryOps,
    {
        match self {
            Component::Ipset { spec } => Ok(ops.ipset.is_exists(&spec.name).await?),
            Component::IpRule { spec } => {
                let wanted = Self::rule_spec(spec);
                let rules = ops.netlink.rule_list(spec.family).await?;
                Ok(rules.iter().any(|r| {
                    r.table == wanted.table && r.fwmark == wanted.fwmark && r.priority == wanted.priority
                }))
            }
            Component::Iptables { spec, rule } => {
                Ok(ops.iptables.exists(spec.family, &rule.table, &rule.chain, &rule.rule)?)
            }
            Component::IpRoute { spec } => {
                let routes = ops.netlink.route_list_table(spec.family, spec.routing.table).await?;
                Ok(!routes.is_empty())
            }
            // both flavours are created and removed together, so existence
            // means both; a drifted-away v6 half must show up as missing
            Component::DnsRedirect { .. } => Ok(ops.iptables.chain_exists(Family::Ipv4, "nat", DNS_CHAIN)?
                && ops.iptables.chain_exists(Family::Ipv6, "nat", DNS_CHAIN)?),
        }
    }

    /// Declarative: should this object exist right now? May consult live
    /// interface state.
    pub async fn should_exist<N, S, F, V>(&self, ops: &Ops<N, S, F, V>) -> bool
    where
        N: NetlinkOps,
        S: IpsetOps,
        F: IptablesOps,
        V: InventoryOps,
    {
        match self {
            Component::Ipset { .. } | Component::DnsRedirect { .. } => true,
            Component::IpRule { spec } | Component::Iptables { spec, .. } | Component::IpRoute { spec } => {
                // persistent config stays while the kill switch holds the
                // table safe; without it, no egress means explicit leak
                spec.routing.kill_switch
                    || egress_available(&ops.netlink, ops.inventory.as_ref(), spec).await
            }
        }
    }

    /// Idempotent create.
    pub async fn create_if_not_exists<N, S, F, V>(&self, ops: &Ops<N, S, F, V>) -> Result<(), Error>
    where
        N: NetlinkOps,
        S: IpsetOps,
        F: IptablesOps,
        V: InventoryOps,
    {
        match self {
            Component::Ipset { spec } => {
                ops.ipset.create_if_not_exists(&spec.name, spec.family).await?;
            }
            Component::IpRule { spec } => {
                if !self.is_exists(ops).await? {
                    let rule = Self::rule_spec(spec);
                    ops.netlink.rule_add(&rule).await?;
                    tracing::debug!(
                        "ip rule add fwmark {} table {} priority {}",
                        rule.fwmark,
                        rule.table,
                        rule.priority
                    );
                }
            }
            Component::Iptables { spec, rule } => {
                if !ops.iptables.exists(spec.family, &rule.table, &rule.chain, &rule.rule)? {
                    ops.iptables.append(spec.family, &rule.table, &rule.chain, &rule.rule)?;
                    tracing::debug!("iptables -t {} -A {} {}", rule.table, rule.chain, rule.rule);
                }
            }
            Component::IpRoute { spec } => {
                if spec.routing.kill_switch {
                    let blackhole = RouteSpec::blackhole(spec.family, spec.routing.table);
                    let routes = ops.netlink.route_list_table(spec.family, spec.routing.table).await?;
                    if !routes.iter().any(|r| r.blackhole) {
                        ops.netlink.route_add(&blackhole).await?;
                        tracing::debug!(
                            "ip route add blackhole default metric {} table {}",
                            blackhole.metric,
                            blackhole.table
                        );
                    }
                }
            }
            Component::DnsRedirect { proxy_port } => {
                rebuild_dns_redirect(ops, *proxy_port).await?;
            }
        }
        Ok(())
    }

    /// Idempotent delete. The ipset variant only flushes: sets referenced
    /// by loaded firewall rules cannot be destroyed safely, so an
    /// empty-but-present set is the dismantled state.
    pub async fn delete_if_exists<N, S, F, V>(&self, ops: &Ops<N, S, F, V>) -> Result<(), Error>
    where
        N: NetlinkOps,
        S: IpsetOps,
        F: IptablesOps,
        V: InventoryOps,
    {
        match self {
            Component::Ipset { spec } => {
                if ops.ipset.is_exists(&spec.name).await? {
                    ops.ipset.flush(&spec.name).await?;
                }
            }
            Component::IpRule { spec } => {
                if self.is_exists(ops).await? {
                    let rule = Self::rule_spec(spec);
                    ops.netlink.rule_del(&rule).await?;
                    tracing::debug!(
                        "ip rule del fwmark {} table {} priority {}",
                        rule.fwmark,
                        rule.table,
                        rule.priority
                    );
                }
            }
            Component::Iptables { spec, rule } => {
                if ops.iptables.exists(spec.family, &rule.table, &rule.chain, &rule.rule)? {
                    ops.iptables.delete(spec.family, &rule.table, &rule.chain, &rule.rule)?;
                    tracing::debug!("iptables -t {} -D {} {}", rule.table, rule.chain, rule.rule);
                }
            }
            Component::IpRoute { spec } => {
                ops.netlink.delete_table(spec.family, spec.routing.table).await?;
                tracing::debug!("ip route flush table {}", spec.routing.table);
            }
            Component::DnsRedirect { .. } => {
                remove_dns_redirect(ops)?;
            }
        }
        Ok(())
    }
}

/// Build (or rebuild) the DNS redirect chain: a dedicated nat chain jumped
/// into from PREROUTING position 1, with one UDP and one TCP port-53
/// REDIRECT per non-loopback interface. Rebuilding flushes first, so the
/// rules always mirror the current interface inventory.
async fn rebuild_dns_redirect<N, S, F, V>(ops: &Ops<N, S, F, V>, proxy_port: u16) -> Result<(), Error>
where
    N: NetlinkOps,
    S: IpsetOps,
    F: IptablesOps,
    V: InventoryOps,
{
    let links = ops.netlink.link_list().await?;
    let interfaces: Vec<&str> = links
        .iter()
        .filter(|l| l.name != "lo")
        .map(|l| l.name.as_str())
        .collect();

    for family in [Family::Ipv4, Family::Ipv6] {
        if !ops.iptables.chain_exists(family, "nat", DNS_CHAIN)? {
            ops.iptables.new_chain(family, "nat", DNS_CHAIN)?;
        }
        let jump = format!("-j {DNS_CHAIN}");
        if !ops.iptables.exists(family, "nat", "PREROUTING", &jump)? {
            ops.iptables.insert(family, "nat", "PREROUTING", &jump, 1)?;
        }
        ops.iptables.flush_chain(family, "nat", DNS_CHAIN)?;
        for interface in &interfaces {
            for proto in ["udp", "tcp"] {
                let rule = format!("-i {interface} -p {proto} --dport 53 -j REDIRECT --to-ports {proxy_port}");
                ops.iptables.append(family, "nat", DNS_CHAIN, &rule)?;
            }
        }
    }
    tracing::debug!(interfaces = interfaces.len(), "dns redirect chain rebuilt");
    Ok(())
}

fn remove_dns_redirect<N, S, F, V>(ops: &Ops<N, S, F, V>) -> Result<(), Error>
where
    F: IptablesOps,
{
    for family in [Family::Ipv4, Family::Ipv6] {
        if !ops.iptables.chain_exists(family, "nat", DNS_CHAIN)? {
            continue;
        }
        let jump = format!("-j {DNS_CHAIN}");
        if ops.iptables.exists(family, "nat", "PREROUTING", &jump)? {
            ops.iptables.delete(family, "nat", "PREROUTING", &jump)?;
        }
        ops.iptables.flush_chain(family, "nat", DNS_CHAIN)?;
        ops.iptables.delete_chain(family, "nat", DNS_CHAIN)?;
    }
    Ok(())
}

// ============================================================================
// Passes
// ============================================================================

/// One reconciliation pass: create what should exist, delete what should
/// not, strictly in list order. An error aborts the pass; kernel state is
/// left no worse than before and the next tick re-attempts.
pub async fn reconcile<N, S, F, V>(components: &[Component], ops: &Ops<N, S, F, V>) -> Result<(), Error>
where
    N: NetlinkOps,
    S: IpsetOps,
    F: IptablesOps,
    V: InventoryOps,
{
    for component in components {
        let should = component.should_exist(ops).await;
        let exists = component.is_exists(ops).await?;
        if should && !exists {
            component.create_if_not_exists(ops).await?;
        } else if !should && exists {
            component.delete_if_exists(ops).await?;
        }
    }
    Ok(())
}

/// Non-mutating self-check over every component.
pub async fn check<N, S, F, V>(components: &[Component], ops: &Ops<N, S, F, V>) -> Vec<CheckReport>
where
    N: NetlinkOps,
    S: IpsetOps,
    F: IptablesOps,
    V: InventoryOps,
{
    let mut reports = Vec::with_capacity(components.len());
    for component in components {
        let should = component.should_exist(ops).await;
        let status = match component.is_exists(ops).await {
            Ok(exists) if exists == should => CheckStatus::Ok,
            Ok(true) => CheckStatus::Unexpected,
            Ok(false) => CheckStatus::Missing,
            Err(error) => CheckStatus::Error(error.to_string()),
        };
        reports.push(CheckReport {
            kind: component.kind(),
            ipset: component.ipset_name().to_string(),
            description: component.description(),
            status,
        });
    }
    reports
}

/// Dismantle in reverse creation order. Failures are logged and the pass
/// continues; one broken ipset must not strand the cleanup of others.
pub async fn undo<N, S, F, V>(components: &[Component], ops: &Ops<N, S, F, V>)
where
    N: NetlinkOps,
    S: IpsetOps,
    F: IptablesOps,
    V: InventoryOps,
{
    for component in components.iter().rev() {
        if let Err(error) = component.delete_if_exists(ops).await {
            tracing::warn!(
                component = %component.description(),
                %error,
                "failed to remove component, continuing teardown"
            );
        }
    }
}
