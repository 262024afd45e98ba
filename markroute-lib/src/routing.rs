//! Routing reconciliation: the dual-route strategy and the persistent
//! per-ipset configuration.
//!
//! Each ipset's custom table converges to exactly one effective default:
//! the chosen interface (metric 100 + its position), the configured
//! fallback gateway (metric 500), or the blackhole (metric 1000). The
//! blackhole is installed whenever the kill switch is on and stays as the
//! fallback the kernel drops to when higher-priority routes disappear.
//! Transitions add the new route before removing obsolete ones, so the
//! table never goes without a default mid-change.
//!
//! A single manager mutex serialises reconciliation across all ipsets:
//! counts are small and netlink is not parallelism-friendly.

use std::collections::HashMap;

use crate::builder;
use crate::component::{self, CheckReport, Component, ComponentKind, Ops};
use crate::config::{Config, IpsetSpec};
use crate::inventory::InventoryOps;
use crate::iptables::IptablesOps;
use crate::ipset::IpsetOps;
use crate::netlink::{NetlinkOps, RouteSpec};
use crate::selector::{self, Chosen};

pub type Error = component::Error;

// ============================================================================
// Persistent reconciler
// ============================================================================

/// Keeps the interface-independent pieces of an ipset present: the set
/// itself, the fwmark policy rule and the packet-marking rules. `remove`
/// takes down rule and marks but never the set; kernel match rules may
/// still reference it, so empty-but-present is the dismantled state.
pub struct PersistentReconciler<N, S, F, V> {
    ops: Ops<N, S, F, V>,
}

impl<N, S, F, V> PersistentReconciler<N, S, F, V>
where
    N: NetlinkOps,
    S: IpsetOps,
    F: IptablesOps,
    V: InventoryOps,
{
    pub fn new(ops: Ops<N, S, F, V>) -> Self {
        Self { ops }
    }

    pub async fn apply(&self, spec: &IpsetSpec) -> Result<(), Error> {
        component::reconcile(&Self::persistent_components(spec), &self.ops).await
    }

    pub async fn remove(&self, spec: &IpsetSpec) -> Result<(), Error> {
        let components: Vec<Component> = Self::persistent_components(spec)
            .into_iter()
            .filter(|c| c.kind() != ComponentKind::Ipset)
            .collect();
        for component in components.iter().rev() {
            component.delete_if_exists(&self.ops).await?;
        }
        Ok(())
    }

    fn persistent_components(spec: &IpsetSpec) -> Vec<Component> {
        builder::ipset_components(spec)
            .into_iter()
            .filter(|c| c.kind() != ComponentKind::IpRoute)
            .collect()
    }
}

// ============================================================================
// Routing manager
// ============================================================================

#[derive(Default)]
struct RoutingState {
    /// ipset name → installed egress; "" denotes blackhole/gateway only.
    last_chosen: HashMap<String, String>,
    /// Sorted non-loopback interface names the DNS redirect chain was
    /// last built for.
    dns_interfaces: Vec<String>,
}

pub struct RoutingConfigManager<N, S, F, V> {
    ops: Ops<N, S, F, V>,
    persistent: PersistentReconciler<N, S, F, V>,
    state: tokio::sync::Mutex<RoutingState>,
}

impl<N, S, F, V> RoutingConfigManager<N, S, F, V>
where
    N: NetlinkOps,
    S: IpsetOps,
    F: IptablesOps + Clone,
    V: InventoryOps + Clone,
{
    pub fn new(ops: Ops<N, S, F, V>) -> Self {
        let persistent = PersistentReconciler::new(ops.clone());
        Self {
            ops,
            persistent,
            state: tokio::sync::Mutex::new(RoutingState::default()),
        }
    }

    /// Installed egress per ipset, for status reporting.
    pub async fn installed_egress(&self) -> HashMap<String, String> {
        self.state.lock().await.last_chosen.clone()
    }

    /// Create the persistent config of every ipset plus the global
    /// components. Idempotent; used on start and reload.
    pub async fn apply_persistent(&self, config: &Config) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        for spec in &config.ipsets {
            self.persistent.apply(spec).await?;
        }
        self.refresh_dns_redirect(config, &mut state, true).await?;
        Ok(())
    }

    /// One routing pass over every ipset. With `force` false, an ipset
    /// whose chosen egress is unchanged since the last pass is skipped
    /// entirely to avoid route churn.
    pub async fn sync_routing(&self, config: &Config, force: bool) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        for spec in &config.ipsets {
            let chosen =
                selector::choose_interface(&self.ops.netlink, self.ops.inventory.as_ref(), spec).await?;
            let chosen_name = chosen.as_ref().map(|c| c.name.clone()).unwrap_or_default();

            if !force
                && state.last_chosen.get(&spec.name).map(String::as_str) == Some(chosen_name.as_str())
            {
                continue;
            }
            if !force {
                let shown = if chosen_name.is_empty() { "<none>" } else { chosen_name.as_str() };
                tracing::info!(ipset = %spec.name, egress = shown, "egress changed, reconciling routes");
            }

            self.reconcile_ipset(spec, &chosen).await?;
            state.last_chosen.insert(spec.name.clone(), chosen_name);
        }
        self.refresh_dns_redirect(config, &mut state, false).await?;
        Ok(())
    }

    /// Non-mutating self-check over everything the snapshot implies.
    pub async fn check(&self, config: &Config) -> Vec<CheckReport> {
        let _state = self.state.lock().await;
        component::check(&builder::all_components(config), &self.ops).await
    }

    /// Dismantle everything the snapshot created, in reverse creation
    /// order, continuing past individual failures.
    pub async fn undo(&self, config: &Config) {
        let mut state = self.state.lock().await;
        component::undo(&builder::all_components(config), &self.ops).await;
        state.last_chosen.clear();
        state.dns_interfaces.clear();
    }

    /// Converge one ipset's table onto the chosen egress. Caller holds
    /// the manager state lock.
    async fn reconcile_ipset(&self, spec: &IpsetSpec, chosen: &Option<Chosen>) -> Result<(), Error> {
        let family = spec.family;
        let table = spec.routing.table;
        let kill_switch = spec.routing.kill_switch;

        let routes = self.ops.netlink.route_list_table(family, table).await?;
        let blackhole_present = routes.iter().any(|r| r.blackhole);
        let other_routes: Vec<RouteSpec> = routes.into_iter().filter(|r| !r.blackhole).collect();

        if let Some(chosen) = chosen {
            // an interface came (back) up: persistent config may have been
            // removed by an earlier explicit-leak pass
            self.persistent.apply(spec).await?;
            if kill_switch && !blackhole_present {
                self.add_blackhole(spec).await?;
            }
            let want = RouteSpec::default_via_interface(family, table, chosen.link_index, chosen.position);
            self.ensure_route(&want, &other_routes).await?;
            for stale in other_routes
                .iter()
                .filter(|r| r.out_ifindex != Some(chosen.link_index))
            {
                self.ops.netlink.route_del(stale).await?;
            }
            tracing::debug!(
                "ip route add default dev {} metric {} table {}",
                chosen.name,
                want.metric,
                table
            );
        } else if let Some(gateway) = spec.routing.default_gateway {
            self.persistent.apply(spec).await?;
            if kill_switch && !blackhole_present {
                self.add_blackhole(spec).await?;
            }
            let want = RouteSpec::default_via_gateway(family, table, gateway);
            self.ensure_route(&want, &other_routes).await?;
            for stale in other_routes.iter().filter(|r| !r.same_selector(&want)) {
                self.ops.netlink.route_del(stale).await?;
            }
            tracing::debug!("ip route add default via {gateway} metric {} table {table}", want.metric);
        } else if !kill_switch {
            // explicit leak: the operator opted out of the blackhole, so
            // dismantle the whole redirection for this ipset
            self.ops.netlink.delete_table(family, table).await?;
            self.persistent.remove(spec).await?;
            tracing::debug!(ipset = %spec.name, "no egress and kill switch off, traffic follows main table");
        } else {
            if !blackhole_present {
                self.add_blackhole(spec).await?;
            }
            // a single-interface ipset keeps its stale route: the kernel
            // falls back to the blackhole while the link is down and the
            // route becomes valid again on link-up without any churn
            if spec.routing.interfaces.len() != 1 {
                for stale in &other_routes {
                    self.ops.netlink.route_del(stale).await?;
                }
            }
            tracing::debug!(ipset = %spec.name, "no egress, traffic blackholed");
        }
        Ok(())
    }

    async fn add_blackhole(&self, spec: &IpsetSpec) -> Result<(), Error> {
        let blackhole = RouteSpec::blackhole(spec.family, spec.routing.table);
        self.ops.netlink.route_add(&blackhole).await?;
        tracing::debug!(
            "ip route add blackhole default metric {} table {}",
            blackhole.metric,
            blackhole.table
        );
        Ok(())
    }

    /// Add-if-not-exists for one route. A route matching the selector but
    /// carrying the wrong metric is converged add-before-remove.
    async fn ensure_route(&self, want: &RouteSpec, existing: &[RouteSpec]) -> Result<(), Error> {
        match existing.iter().find(|r| r.same_selector(want)) {
            Some(found) if found.metric == want.metric => Ok(()),
            Some(found) => {
                self.ops.netlink.route_add(want).await?;
                self.ops.netlink.route_del(found).await?;
                Ok(())
            }
            None => {
                self.ops.netlink.route_add(want).await?;
                Ok(())
            }
        }
    }

    /// Rebuild the global DNS redirect chain when the set of non-loopback
    /// interfaces changed since the last build (or unconditionally on
    /// apply).
    async fn refresh_dns_redirect(
        &self,
        config: &Config,
        state: &mut RoutingState,
        force: bool,
    ) -> Result<(), Error> {
        let Some(component) = builder::global_components(config).into_iter().next() else {
            return Ok(());
        };
        let links = self.ops.netlink.link_list().await?;
        let mut interfaces: Vec<String> = links
            .iter()
            .filter(|l| l.name != "lo")
            .map(|l| l.name.clone())
            .collect();
        interfaces.sort();

        if force || state.dns_interfaces != interfaces {
            component.create_if_not_exists(&self.ops).await?;
            state.dns_interfaces = interfaces;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
