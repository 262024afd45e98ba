//! Stateful mocks for the kernel-facing trait abstractions.
//!
//! These mocks track actual state (routes, rules, sets, chains that exist)
//! rather than just verifying call sequences. This lets tests assert on
//! the simulated kernel's _state_ after a lifecycle operation, not just on
//! which calls happened.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability in async contexts.

#![cfg(test)]

use async_trait::async_trait;
use cidr::IpCidr;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{Family, ListSource};
use crate::inventory::{self, InterfaceStatus, InventoryOps};
use crate::ipset::{self, filter_entries, BulkReport, IpsetOps};
use crate::iptables::{self, IptablesOps};
use crate::lists::{self, ListOps};
use crate::netlink::{self, LinkInfo, NetlinkOps, RouteSpec, RuleSpec};

// ============================================================================
// MockNetlinkOps
// ============================================================================

#[derive(Debug, Default)]
pub struct NetlinkState {
    pub links: Vec<LinkInfo>,
    pub rules: Vec<RuleSpec>,
    pub routes: Vec<RouteSpec>,
    /// Ordered log of route mutations, for transition-ordering assertions.
    pub journal: Vec<String>,
    /// Map of operation name -> error message. If set, the operation fails.
    pub fail_on: HashMap<String, String>,
}

impl NetlinkState {
    fn check_fail(&self, op: &str) -> Result<(), netlink::Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(netlink::Error::General(msg.clone()))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct MockNetlinkOps {
    pub state: Arc<Mutex<NetlinkState>>,
}

impl MockNetlinkOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetlinkState::default())),
        }
    }

    pub fn with_state(state: NetlinkState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn set_link(&self, name: &str, is_up: bool) {
        let mut s = self.state.lock().unwrap();
        if let Some(link) = s.links.iter_mut().find(|l| l.name == name) {
            link.is_up = is_up;
        }
    }

    pub fn routes_in_table(&self, table: u32) -> Vec<RouteSpec> {
        let s = self.state.lock().unwrap();
        s.routes.iter().filter(|r| r.table == table).cloned().collect()
    }

    pub fn fail_on(&self, op: &str, msg: &str) {
        let mut s = self.state.lock().unwrap();
        s.fail_on.insert(op.into(), msg.into());
    }

    pub fn journal(&self) -> Vec<String> {
        self.state.lock().unwrap().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.lock().unwrap().journal.clear();
    }
}

fn journal_route(op: &str, route: &RouteSpec) -> String {
    format!(
        "{op} table={} oif={:?} blackhole={} metric={}",
        route.table, route.out_ifindex, route.blackhole, route.metric
    )
}

#[async_trait]
impl NetlinkOps for MockNetlinkOps {
    async fn link_list(&self) -> Result<Vec<LinkInfo>, netlink::Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("link_list")?;
        Ok(s.links.clone())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), netlink::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_add")?;

        if s.rules.contains(rule) {
            return Err(netlink::Error::General(format!(
                "rule already exists: fwmark={} table={}",
                rule.fwmark, rule.table
            )));
        }
        s.rules.push(rule.clone());
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), netlink::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_del")?;

        let before = s.rules.len();
        s.rules.retain(|r| r != rule);
        if s.rules.len() == before {
            return Err(netlink::Error::General("rule not found".into()));
        }
        Ok(())
    }

    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>, netlink::Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("rule_list")?;
        Ok(s.rules.iter().filter(|r| r.family == family).cloned().collect())
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), netlink::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_add")?;

        // the kernel rejects an exact duplicate but allows same-selector
        // routes that differ in metric
        let exists = s
            .routes
            .iter()
            .any(|r| r.same_selector(route) && r.metric == route.metric);
        if exists {
            return Err(netlink::Error::General(format!(
                "route already exists in table {} metric {}",
                route.table, route.metric
            )));
        }
        s.journal.push(journal_route("route_add", route));
        s.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), netlink::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_del")?;

        let before = s.routes.len();
        s.routes.retain(|r| !(r.same_selector(route) && r.metric == route.metric));
        if s.routes.len() == before {
            return Err(netlink::Error::General("route not found".into()));
        }
        s.journal.push(journal_route("route_del", route));
        Ok(())
    }

    async fn route_list_table(&self, family: Family, table: u32) -> Result<Vec<RouteSpec>, netlink::Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("route_list_table")?;
        Ok(s.routes
            .iter()
            .filter(|r| r.family == family && r.table == table)
            .cloned()
            .collect())
    }
}

// ============================================================================
// MockIpsetOps
// ============================================================================

#[derive(Debug, Clone)]
pub struct MockSet {
    pub family: Family,
    /// (cidr, ttl) pairs; bulk-loaded entries carry ttl 0.
    pub entries: Vec<(String, u32)>,
}

#[derive(Debug, Default)]
pub struct IpsetState {
    pub sets: HashMap<String, MockSet>,
    pub fail_on: HashMap<String, String>,
}

impl IpsetState {
    fn check_fail(&self, op: &str) -> Result<(), ipset::Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(ipset::Error::Backend(msg.clone()))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct MockIpsetOps {
    pub state: Arc<Mutex<IpsetState>>,
}

impl MockIpsetOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(IpsetState::default())),
        }
    }

    pub fn entries(&self, name: &str) -> Vec<String> {
        let s = self.state.lock().unwrap();
        s.sets
            .get(name)
            .map(|set| set.entries.iter().map(|(cidr, _)| cidr.clone()).collect())
            .unwrap_or_default()
    }

    pub fn fail_on(&self, op: &str, msg: &str) {
        let mut s = self.state.lock().unwrap();
        s.fail_on.insert(op.into(), msg.into());
    }
}

#[async_trait]
impl IpsetOps for MockIpsetOps {
    async fn create_if_not_exists(&self, name: &str, family: Family) -> Result<(), ipset::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("create_if_not_exists")?;
        s.sets.entry(name.to_string()).or_insert(MockSet {
            family,
            entries: Vec::new(),
        });
        Ok(())
    }

    async fn flush(&self, name: &str) -> Result<(), ipset::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("flush")?;
        match s.sets.get_mut(name) {
            Some(set) => {
                set.entries.clear();
                Ok(())
            }
            None => Err(ipset::Error::Backend(format!("set {name} does not exist"))),
        }
    }

    async fn destroy(&self, name: &str) -> Result<(), ipset::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("destroy")?;
        match s.sets.remove(name) {
            Some(_) => Ok(()),
            None => Err(ipset::Error::Backend(format!("set {name} does not exist"))),
        }
    }

    async fn is_exists(&self, name: &str) -> Result<bool, ipset::Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("is_exists")?;
        Ok(s.sets.contains_key(name))
    }

    async fn add_with_ttl(&self, name: &str, entry: &IpCidr, ttl_seconds: u32) -> Result<(), ipset::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("add_with_ttl")?;
        match s.sets.get_mut(name) {
            Some(set) => {
                set.entries.push((entry.to_string(), ttl_seconds));
                Ok(())
            }
            None => Err(ipset::Error::Backend(format!("set {name} does not exist"))),
        }
    }

    async fn bulk_insert(
        &self,
        name: &str,
        family: Family,
        flush_first: bool,
        entries: &[String],
    ) -> Result<BulkReport, ipset::Error> {
        // same filtering the real restore writer applies
        let (kept, report) = filter_entries(family, entries)?;

        let mut s = self.state.lock().unwrap();
        s.check_fail("bulk_insert")?;
        match s.sets.get_mut(name) {
            Some(set) => {
                if flush_first {
                    set.entries.clear();
                }
                set.entries.extend(kept.iter().map(|c| (c.to_string(), 0)));
                Ok(report)
            }
            None => Err(ipset::Error::Backend(format!("set {name} does not exist"))),
        }
    }
}

// ============================================================================
// MockIptablesOps
// ============================================================================

const BUILTIN_CHAINS: &[&str] = &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"];

#[derive(Debug, Default)]
pub struct IptablesState {
    pub chains: HashMap<(Family, String, String), Vec<String>>,
    pub fail_on: HashMap<String, String>,
}

impl IptablesState {
    fn check_fail(&self, op: &str) -> Result<(), iptables::Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(iptables::Error::Backend(msg.clone()))
        } else {
            Ok(())
        }
    }

    fn key(family: Family, table: &str, chain: &str) -> (Family, String, String) {
        (family, table.to_string(), chain.to_string())
    }
}

#[derive(Clone)]
pub struct MockIptablesOps {
    pub state: Arc<Mutex<IptablesState>>,
}

impl MockIptablesOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(IptablesState::default())),
        }
    }

    pub fn rules_in(&self, family: Family, table: &str, chain: &str) -> Vec<String> {
        let s = self.state.lock().unwrap();
        s.chains
            .get(&IptablesState::key(family, table, chain))
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_on(&self, op: &str, msg: &str) {
        let mut s = self.state.lock().unwrap();
        s.fail_on.insert(op.into(), msg.into());
    }
}

impl IptablesOps for MockIptablesOps {
    fn chain_exists(&self, family: Family, table: &str, chain: &str) -> Result<bool, iptables::Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("chain_exists")?;
        Ok(BUILTIN_CHAINS.contains(&chain) || s.chains.contains_key(&IptablesState::key(family, table, chain)))
    }

    fn new_chain(&self, family: Family, table: &str, chain: &str) -> Result<(), iptables::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("new_chain")?;
        let key = IptablesState::key(family, table, chain);
        if s.chains.contains_key(&key) {
            return Err(iptables::Error::Backend(format!("chain {chain} already exists")));
        }
        s.chains.insert(key, Vec::new());
        Ok(())
    }

    fn flush_chain(&self, family: Family, table: &str, chain: &str) -> Result<(), iptables::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("flush_chain")?;
        s.chains
            .entry(IptablesState::key(family, table, chain))
            .or_default()
            .clear();
        Ok(())
    }

    fn delete_chain(&self, family: Family, table: &str, chain: &str) -> Result<(), iptables::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("delete_chain")?;
        let key = IptablesState::key(family, table, chain);
        match s.chains.get(&key) {
            Some(rules) if rules.is_empty() => {
                s.chains.remove(&key);
                Ok(())
            }
            Some(_) => Err(iptables::Error::Backend(format!("chain {chain} is not empty"))),
            None => Err(iptables::Error::Backend(format!("chain {chain} does not exist"))),
        }
    }

    fn append(&self, family: Family, table: &str, chain: &str, rule: &str) -> Result<(), iptables::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("append")?;
        s.chains
            .entry(IptablesState::key(family, table, chain))
            .or_default()
            .push(rule.to_string());
        Ok(())
    }

    fn insert(&self, family: Family, table: &str, chain: &str, rule: &str, position: i32) -> Result<(), iptables::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("insert")?;
        let rules = s.chains.entry(IptablesState::key(family, table, chain)).or_default();
        let index = ((position - 1).max(0) as usize).min(rules.len());
        rules.insert(index, rule.to_string());
        Ok(())
    }

    fn delete(&self, family: Family, table: &str, chain: &str, rule: &str) -> Result<(), iptables::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("delete")?;
        let key = IptablesState::key(family, table, chain);
        let rules = s
            .chains
            .get_mut(&key)
            .ok_or_else(|| iptables::Error::Backend(format!("chain {chain} does not exist")))?;
        match rules.iter().position(|r| r == rule) {
            Some(index) => {
                rules.remove(index);
                Ok(())
            }
            None => Err(iptables::Error::Backend("rule not found".into())),
        }
    }

    fn exists(&self, family: Family, table: &str, chain: &str, rule: &str) -> Result<bool, iptables::Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("exists")?;
        Ok(s.chains
            .get(&IptablesState::key(family, table, chain))
            .is_some_and(|rules| rules.iter().any(|r| r == rule)))
    }

    fn list(&self, family: Family, table: &str, chain: &str) -> Result<Vec<String>, iptables::Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("list")?;
        Ok(s.chains
            .get(&IptablesState::key(family, table, chain))
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// MockInventoryOps
// ============================================================================

#[derive(Clone)]
pub struct MockInventoryOps {
    pub statuses: Arc<Mutex<HashMap<String, InterfaceStatus>>>,
    fail: Arc<Mutex<Option<String>>>,
}

impl MockInventoryOps {
    pub fn with_statuses(statuses: HashMap<String, InterfaceStatus>) -> Self {
        Self {
            statuses: Arc::new(Mutex::new(statuses)),
            fail: Arc::new(Mutex::new(None)),
        }
    }

    pub fn failing(msg: &str) -> Self {
        Self {
            statuses: Arc::new(Mutex::new(HashMap::new())),
            fail: Arc::new(Mutex::new(Some(msg.to_string()))),
        }
    }

    pub fn set_connected(&self, name: &str, connected: &str) {
        let mut statuses = self.statuses.lock().unwrap();
        statuses
            .entry(name.to_string())
            .or_insert_with(InterfaceStatus::default)
            .connected = connected.to_string();
    }
}

#[async_trait]
impl InventoryOps for MockInventoryOps {
    async fn get_interfaces(&self) -> Result<HashMap<String, InterfaceStatus>, inventory::Error> {
        if let Some(msg) = self.fail.lock().unwrap().clone() {
            return Err(inventory::Error::Unavailable(msg));
        }
        Ok(self.statuses.lock().unwrap().clone())
    }
}

// ============================================================================
// MockListOps
// ============================================================================

#[derive(Clone)]
pub struct MockListOps {
    pub contents: Arc<Mutex<HashMap<String, Vec<String>>>>,
    pub downloads: Arc<Mutex<u32>>,
    fail_download: Arc<Mutex<bool>>,
}

impl MockListOps {
    pub fn with_contents(contents: &[(&str, &[&str])]) -> Self {
        Self {
            contents: Arc::new(Mutex::new(
                contents
                    .iter()
                    .map(|(name, entries)| {
                        (
                            name.to_string(),
                            entries.iter().map(|e| e.to_string()).collect(),
                        )
                    })
                    .collect(),
            )),
            downloads: Arc::new(Mutex::new(0)),
            fail_download: Arc::new(Mutex::new(false)),
        }
    }

    pub fn fail_downloads(&self) {
        *self.fail_download.lock().unwrap() = true;
    }

    pub fn download_count(&self) -> u32 {
        *self.downloads.lock().unwrap()
    }
}

#[async_trait]
impl ListOps for MockListOps {
    async fn download(&self, _lists: &[ListSource]) -> Result<(), lists::Error> {
        if *self.fail_download.lock().unwrap() {
            return Err(lists::Error::IO(std::io::Error::other("simulated download failure")));
        }
        *self.downloads.lock().unwrap() += 1;
        Ok(())
    }

    async fn load(&self, _lists: &[ListSource], names: &[String]) -> Result<Vec<String>, lists::Error> {
        let contents = self.contents.lock().unwrap();
        Ok(names
            .iter()
            .filter_map(|name| contents.get(name))
            .flatten()
            .cloned()
            .collect())
    }
}
