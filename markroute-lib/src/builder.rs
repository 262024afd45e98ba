//! Component builders: turn a configuration snapshot into ordered
//! component lists.
//!
//! Builders are pure: the same snapshot always yields the same list.
//! Behaviour differences across ticks come from `should_exist`, never
//! from construction.

use std::sync::Arc;

use crate::component::Component;
use crate::config::{Config, IpsetSpec};
use crate::iptables;

/// Components of one ipset, in creation order. The order is load-bearing:
/// the policy rule references the table the route component manages, and
/// the marking rules reference the set. Deletion walks this in reverse.
pub fn ipset_components(spec: &IpsetSpec) -> Vec<Component> {
    let spec = Arc::new(spec.clone());
    let mut components = vec![
        Component::Ipset { spec: Arc::clone(&spec) },
        Component::IpRule { spec: Arc::clone(&spec) },
    ];
    for rule in iptables::mark_rules(&spec) {
        components.push(Component::Iptables {
            spec: Arc::clone(&spec),
            rule,
        });
    }
    components.push(Component::IpRoute { spec });
    components
}

/// Global components outside any ipset.
pub fn global_components(config: &Config) -> Vec<Component> {
    let mut components = Vec::new();
    if config.general.dns_redirect {
        match config.general.dns_proxy_port() {
            Ok(proxy_port) => components.push(Component::DnsRedirect { proxy_port }),
            Err(error) => {
                tracing::warn!(%error, "dns redirect enabled but proxy address unusable, skipping");
            }
        }
    }
    components
}

/// Every component the snapshot implies: per-ipset lists in declaration
/// order, then the global ones.
pub fn all_components(config: &Config) -> Vec<Component> {
    let mut components: Vec<Component> = config.ipsets.iter().flat_map(|s| ipset_components(s)).collect();
    components.extend(global_components(config));
    components
}
