//! Egress interface selection.
//!
//! Walks an ipset's candidate interfaces in preference order and picks the
//! first usable one. Usability requires the kernel link to exist and be UP;
//! the platform inventory can veto a candidate, but only with an explicit
//! `connected = "no"`. Missing or partial inventory data never does.

use std::collections::HashMap;

use crate::config::IpsetSpec;
use crate::inventory::InventoryOps;
use crate::netlink::{self, NetlinkOps};

/// A selected egress and where it sits in the candidate list; the position
/// becomes the route metric offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Chosen {
    pub name: String,
    pub position: usize,
    pub link_index: u32,
}

/// Pick the best egress for `spec`, or `None` when no candidate is usable.
///
/// Never mutates state. The inventory call carries its own timeout and any
/// failure degrades to selection on kernel link state alone.
pub async fn choose_interface<N, V>(
    netlink: &N,
    inventory: Option<&V>,
    spec: &IpsetSpec,
) -> Result<Option<Chosen>, netlink::Error>
where
    N: NetlinkOps,
    V: InventoryOps,
{
    let statuses = match inventory {
        Some(client) => match client.get_interfaces().await {
            Ok(map) => map,
            Err(error) => {
                tracing::warn!(%error, "inventory unavailable, selecting on link state alone");
                HashMap::new()
            }
        },
        None => HashMap::new(),
    };

    let links = netlink.link_list().await?;

    for (position, name) in spec.routing.interfaces.iter().enumerate() {
        let link = match links.iter().find(|l| &l.name == name) {
            Some(link) => link,
            None => {
                tracing::debug!(interface = %name, "candidate missing from kernel, skipping");
                continue;
            }
        };
        if !link.is_up {
            tracing::debug!(interface = %name, "candidate link is down, skipping");
            continue;
        }
        if let Some(status) = statuses.get(name)
            && status.is_disconnected()
        {
            tracing::debug!(interface = %name, "inventory reports candidate disconnected, skipping");
            continue;
        }
        return Ok(Some(Chosen {
            name: name.clone(),
            position,
            link_index: link.index,
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Family, RoutingSpec};
    use crate::inventory::InterfaceStatus;
    use crate::mocks::{MockInventoryOps, MockNetlinkOps, NetlinkState};
    use crate::netlink::LinkInfo;

    fn spec(interfaces: &[&str]) -> IpsetSpec {
        IpsetSpec {
            name: "vpn_a".into(),
            family: Family::Ipv4,
            lists: vec![],
            flush_before_apply: false,
            routing: RoutingSpec {
                interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
                default_gateway: None,
                fwmark: 1,
                table: 100,
                priority: 100,
                kill_switch: true,
            },
            iptables_rules: vec![],
        }
    }

    fn links(up: &[(&str, u32, bool)]) -> MockNetlinkOps {
        MockNetlinkOps::with_state(NetlinkState {
            links: up
                .iter()
                .map(|(name, index, is_up)| LinkInfo {
                    index: *index,
                    name: name.to_string(),
                    is_up: *is_up,
                })
                .collect(),
            ..Default::default()
        })
    }

    fn inventory(entries: &[(&str, &str)]) -> MockInventoryOps {
        MockInventoryOps::with_statuses(
            entries
                .iter()
                .map(|(name, connected)| {
                    (
                        name.to_string(),
                        InterfaceStatus {
                            connected: connected.to_string(),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn picks_first_up_candidate() -> anyhow::Result<()> {
        let netlink = links(&[("wg0", 10, true), ("wg1", 11, true)]);
        let chosen = choose_interface::<_, MockInventoryOps>(&netlink, None, &spec(&["wg0", "wg1"])).await?;

        let chosen = chosen.unwrap();
        assert_eq!(chosen.name, "wg0");
        assert_eq!(chosen.position, 0);
        assert_eq!(chosen.link_index, 10);
        Ok(())
    }

    #[tokio::test]
    async fn skips_down_and_missing_links() -> anyhow::Result<()> {
        let netlink = links(&[("wg0", 10, false), ("wg2", 12, true)]);
        let chosen = choose_interface::<_, MockInventoryOps>(&netlink, None, &spec(&["wg0", "wg1", "wg2"])).await?;

        let chosen = chosen.unwrap();
        assert_eq!(chosen.name, "wg2");
        assert_eq!(chosen.position, 2);
        Ok(())
    }

    #[tokio::test]
    async fn explicit_inventory_no_disqualifies() -> anyhow::Result<()> {
        let netlink = links(&[("wg0", 10, true), ("wg1", 11, true)]);
        let inv = inventory(&[("wg0", "no")]);
        let chosen = choose_interface(&netlink, Some(&inv), &spec(&["wg0", "wg1"])).await?;

        assert_eq!(chosen.unwrap().name, "wg1");
        Ok(())
    }

    #[tokio::test]
    async fn empty_connected_field_is_usable() -> anyhow::Result<()> {
        let netlink = links(&[("wg0", 10, true), ("wg1", 11, true)]);
        let inv = inventory(&[("wg0", ""), ("wg1", "")]);
        let chosen = choose_interface(&netlink, Some(&inv), &spec(&["wg0", "wg1"])).await?;

        assert_eq!(chosen.unwrap().name, "wg0");
        Ok(())
    }

    #[tokio::test]
    async fn inventory_link_field_is_ignored_when_connected_is_empty() -> anyhow::Result<()> {
        // only an explicit connected = "no" disqualifies; a reported-down
        // platform link with an empty connected field stays usable as long
        // as the kernel says UP
        let netlink = links(&[("wg0", 10, true)]);
        let inv = MockInventoryOps::with_statuses(
            [(
                "wg0".to_string(),
                InterfaceStatus {
                    link: "down".into(),
                    connected: String::new(),
                    ..Default::default()
                },
            )]
            .into(),
        );
        let chosen = choose_interface(&netlink, Some(&inv), &spec(&["wg0"])).await?;

        assert_eq!(chosen.unwrap().name, "wg0");
        Ok(())
    }

    #[tokio::test]
    async fn inventory_failure_degrades_to_link_state() -> anyhow::Result<()> {
        let netlink = links(&[("wg0", 10, true)]);
        let inv = MockInventoryOps::failing("simulated inventory outage");
        let chosen = choose_interface(&netlink, Some(&inv), &spec(&["wg0"])).await?;

        assert_eq!(chosen.unwrap().name, "wg0");
        Ok(())
    }

    #[tokio::test]
    async fn no_usable_candidate_yields_none() -> anyhow::Result<()> {
        let netlink = links(&[("wg0", 10, false)]);
        let chosen = choose_interface::<_, MockInventoryOps>(&netlink, None, &spec(&["wg0", "wg1"])).await?;

        assert!(chosen.is_none());
        Ok(())
    }
}
