//! Abstraction over rtnetlink operations for testability.
//!
//! Defines the [`NetlinkOps`] trait and domain types ([`RouteSpec`],
//! [`RuleSpec`], [`LinkInfo`]) that decouple the reconcilers from the raw
//! netlink wire format.
//!
//! Production code uses [`RealNetlinkOps`] which wraps `rtnetlink::Handle`.
//! Tests use stateful mocks (see the `mocks` module).

use async_trait::async_trait;
use futures::TryStreamExt;
use rtnetlink::packet_route::link::{LinkAttribute, LinkFlags};
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteMessage, RouteType};
use rtnetlink::packet_route::rule::RuleAttribute;
use rtnetlink::{IpVersion, RouteMessageBuilder};
use thiserror::Error;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::Family;

/// Metric of a default route bound to the interface at position 0 of an
/// ipset's candidate list; position N gets base + N.
pub const METRIC_INTERFACE_BASE: u32 = 100;
/// Metric of the configured-gateway fallback route.
pub const METRIC_GATEWAY: u32 = 500;
/// Metric of the blackhole fallback. Highest of the three so that any
/// interface or gateway route wins while present.
pub const METRIC_BLACKHOLE: u32 = 1000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("rtnetlink error: {0}")]
    Rtnetlink(#[from] rtnetlink::Error),
    #[error("netlink error: {0}")]
    General(String),
}

// ============================================================================
// Domain Types
// ============================================================================

/// Network link (interface) information.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub is_up: bool,
}

/// Policy routing rule: packets with `fwmark` go to `table` at `priority`.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSpec {
    pub family: Family,
    pub fwmark: u32,
    pub table: u32,
    pub priority: u32,
}

/// Route specification decoupled from the rtnetlink wire format.
///
/// The engine only ever creates default routes (dst 0/0); listing a table
/// may surface foreign routes, which carry their destination so deletion
/// can address them precisely.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub family: Family,
    pub table: u32,
    pub blackhole: bool,
    pub out_ifindex: Option<u32>,
    pub gateway: Option<IpAddr>,
    pub destination: Option<IpAddr>,
    pub prefix_len: u8,
    /// Kernel route priority (metric).
    pub metric: u32,
}

impl RouteSpec {
    /// Default route through a candidate interface; metric encodes the
    /// interface's position in the candidate list.
    pub fn default_via_interface(family: Family, table: u32, ifindex: u32, position: usize) -> Self {
        Self {
            family,
            table,
            blackhole: false,
            out_ifindex: Some(ifindex),
            gateway: None,
            destination: None,
            prefix_len: 0,
            metric: METRIC_INTERFACE_BASE + position as u32,
        }
    }

    /// Default route through the configured fallback gateway.
    pub fn default_via_gateway(family: Family, table: u32, gateway: IpAddr) -> Self {
        Self {
            family,
            table,
            blackhole: false,
            out_ifindex: None,
            gateway: Some(gateway),
            destination: None,
            prefix_len: 0,
            metric: METRIC_GATEWAY,
        }
    }

    /// Blackhole fallback for a table.
    pub fn blackhole(family: Family, table: u32) -> Self {
        Self {
            family,
            table,
            blackhole: true,
            out_ifindex: None,
            gateway: None,
            destination: None,
            prefix_len: 0,
            metric: METRIC_BLACKHOLE,
        }
    }

    /// Existence match key: blackhole routes match on (table, type),
    /// interface routes on (table, out-interface), gateway routes on
    /// (table, next-hop). The metric is deliberately NOT part of the key
    /// so reconciliation can spot a route installed with the wrong one.
    pub fn same_selector(&self, other: &RouteSpec) -> bool {
        if self.family != other.family || self.table != other.table {
            return false;
        }
        if self.blackhole || other.blackhole {
            return self.blackhole == other.blackhole;
        }
        match (self.out_ifindex, other.out_ifindex) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.gateway == other.gateway,
            _ => false,
        }
    }
}

// ============================================================================
// Trait
// ============================================================================

/// Abstraction over netlink link/rule/route operations.
///
/// Implementors must be cheaply cloneable (e.g. via `Arc` or because the
/// underlying handle is already reference-counted).
#[async_trait]
pub trait NetlinkOps: Send + Sync + Clone {
    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error>;

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>, Error>;

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error>;
    /// Every route currently present in `table`.
    async fn route_list_table(&self, family: Family, table: u32) -> Result<Vec<RouteSpec>, Error>;

    /// Wipe a table.
    async fn delete_table(&self, family: Family, table: u32) -> Result<(), Error> {
        for route in self.route_list_table(family, table).await? {
            self.route_del(&route).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Real Implementation
// ============================================================================

/// Production [`NetlinkOps`] backed by an `rtnetlink::Handle`.
#[derive(Clone)]
pub struct RealNetlinkOps {
    handle: rtnetlink::Handle,
}

impl RealNetlinkOps {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    fn build_route_message(spec: &RouteSpec) -> RouteMessage {
        let mut msg = match spec.family {
            Family::Ipv4 => {
                let dst = match spec.destination {
                    Some(IpAddr::V4(ip)) => ip,
                    _ => Ipv4Addr::UNSPECIFIED,
                };
                let mut builder = RouteMessageBuilder::<Ipv4Addr>::default()
                    .destination_prefix(dst, spec.prefix_len)
                    .table_id(spec.table);
                if let Some(idx) = spec.out_ifindex {
                    builder = builder.output_interface(idx);
                }
                if let Some(IpAddr::V4(gw)) = spec.gateway {
                    builder = builder.gateway(gw);
                }
                builder.build()
            }
            Family::Ipv6 => {
                let dst = match spec.destination {
                    Some(IpAddr::V6(ip)) => ip,
                    _ => Ipv6Addr::UNSPECIFIED,
                };
                let mut builder = RouteMessageBuilder::<Ipv6Addr>::default()
                    .destination_prefix(dst, spec.prefix_len)
                    .table_id(spec.table);
                if let Some(idx) = spec.out_ifindex {
                    builder = builder.output_interface(idx);
                }
                if let Some(IpAddr::V6(gw)) = spec.gateway {
                    builder = builder.gateway(gw);
                }
                builder.build()
            }
        };
        if spec.blackhole {
            msg.header.kind = RouteType::BlackHole;
        }
        msg.attributes.push(RouteAttribute::Priority(spec.metric));
        msg
    }

    fn route_message_to_spec(family: Family, msg: &RouteMessage) -> RouteSpec {
        let out_ifindex = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Oif(idx) => Some(*idx),
            _ => None,
        });
        let gateway = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });
        let destination = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Destination(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });
        let table = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Table(id) => Some(*id),
                _ => None,
            })
            .unwrap_or(msg.header.table as u32);
        let metric = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Priority(p) => Some(*p),
                _ => None,
            })
            .unwrap_or(0);

        RouteSpec {
            family,
            table,
            blackhole: msg.header.kind == RouteType::BlackHole,
            out_ifindex,
            gateway,
            destination,
            prefix_len: msg.header.destination_prefix_length,
            metric,
        }
    }
}

fn ip_version(family: Family) -> IpVersion {
    match family {
        Family::Ipv4 => IpVersion::V4,
        Family::Ipv6 => IpVersion::V6,
    }
}

#[async_trait]
impl NetlinkOps for RealNetlinkOps {
    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let links: Vec<_> = self.handle.link().get().execute().try_collect().await?;

        Ok(links
            .iter()
            .filter_map(|link| {
                let name = link.attributes.iter().find_map(|a| match a {
                    LinkAttribute::IfName(n) => Some(n.clone()),
                    _ => None,
                })?;
                Some(LinkInfo {
                    index: link.header.index,
                    name,
                    is_up: link.header.flags.contains(LinkFlags::Up),
                })
            })
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        use rtnetlink::packet_route::rule::RuleAction;
        let request = self.handle.rule().add();
        match rule.family {
            Family::Ipv4 => {
                request
                    .v4()
                    .fw_mark(rule.fwmark)
                    .priority(rule.priority)
                    .table_id(rule.table)
                    .action(RuleAction::ToTable)
                    .execute()
                    .await?
            }
            Family::Ipv6 => {
                request
                    .v6()
                    .fw_mark(rule.fwmark)
                    .priority(rule.priority)
                    .table_id(rule.table)
                    .action(RuleAction::ToTable)
                    .execute()
                    .await?
            }
        };
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        // find the matching rule message and delete it
        let rules: Vec<_> = self
            .handle
            .rule()
            .get(ip_version(rule.family))
            .execute()
            .try_collect()
            .await?;

        for msg in rules {
            let has_mark = msg
                .attributes
                .iter()
                .any(|a| matches!(a, RuleAttribute::FwMark(m) if *m == rule.fwmark));
            let has_table = msg
                .attributes
                .iter()
                .any(|a| matches!(a, RuleAttribute::Table(t) if *t == rule.table));
            let has_priority = msg
                .attributes
                .iter()
                .any(|a| matches!(a, RuleAttribute::Priority(p) if *p == rule.priority));

            if has_mark && has_table && has_priority {
                self.handle.rule().del(msg).execute().await?;
                return Ok(());
            }
        }

        Err(Error::General(format!(
            "rule not found: fwmark={:#x} table={} priority={}",
            rule.fwmark, rule.table, rule.priority
        )))
    }

    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>, Error> {
        let rules: Vec<_> = self
            .handle
            .rule()
            .get(ip_version(family))
            .execute()
            .try_collect()
            .await?;

        Ok(rules
            .iter()
            .filter_map(|msg| {
                let fwmark = msg.attributes.iter().find_map(|a| match a {
                    RuleAttribute::FwMark(m) => Some(*m),
                    _ => None,
                })?;
                let table = msg.attributes.iter().find_map(|a| match a {
                    RuleAttribute::Table(t) => Some(*t),
                    _ => None,
                })?;
                let priority = msg
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        RuleAttribute::Priority(p) => Some(*p),
                        _ => None,
                    })
                    .unwrap_or(0);

                Some(RuleSpec {
                    family,
                    fwmark,
                    table,
                    priority,
                })
            })
            .collect())
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        self.handle.route().add(msg).execute().await?;
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        self.handle.route().del(msg).execute().await?;
        Ok(())
    }

    async fn route_list_table(&self, family: Family, table: u32) -> Result<Vec<RouteSpec>, Error> {
        let filter = match family {
            Family::Ipv4 => RouteMessageBuilder::<Ipv4Addr>::default().table_id(table).build(),
            Family::Ipv6 => RouteMessageBuilder::<Ipv6Addr>::default().table_id(table).build(),
        };
        let routes: Vec<_> = self.handle.route().get(filter).execute().try_collect().await?;

        // route dumps are not reliably filtered kernel-side for tables
        // above 255, so filter again here
        Ok(routes
            .iter()
            .map(|msg| Self::route_message_to_spec(family, msg))
            .filter(|spec| spec.table == table)
            .collect())
    }
}
