//! Service lifecycle: start, periodic reconciliation, signal-driven
//! reload, stop.
//!
//! The configuration snapshot is frozen at start. Whatever the file on
//! disk says later, cleanup dismantles exactly what this instance created.
//! The loop body runs inside a crash-isolated runner that catches panics
//! and errors, backs off exponentially and restarts, observing
//! cancellation before and after every wait.

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::command::{Command, IpsetStatus, Response, StatusResponse};
use crate::component::{self, CheckReport, Ops};
use crate::config::{self, Config};
use crate::fingerprint;
use crate::inventory::InventoryOps;
use crate::iptables::IptablesOps;
use crate::ipset::{self, IpsetOps};
use crate::lists::{self, ListOps};
use crate::netlink::NetlinkOps;
use crate::routing::RoutingConfigManager;

/// How long `stop` waits for the loop to dismantle and exit.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("service already running")]
    AlreadyRunning,
    #[error("service not running")]
    NotRunning,
    #[error("service loop did not stop within {}s", STOP_TIMEOUT.as_secs())]
    StopTimeout,
    #[error(transparent)]
    Reconcile(#[from] component::Error),
    #[error(transparent)]
    Ipset(#[from] ipset::Error),
    #[error("list error: {0}")]
    Lists(#[from] lists::Error),
    #[error("fingerprint error: {0}")]
    Fingerprint(#[from] fingerprint::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoopSignal {
    Reload,
    RefreshRouting,
}

#[derive(Default)]
struct ServiceState {
    running: bool,
    cancel: Option<CancellationToken>,
    done: Option<oneshot::Receiver<()>>,
    snapshot: Option<Arc<Config>>,
    fingerprint: Option<String>,
    signal_tx: Option<mpsc::Sender<LoopSignal>>,
}

pub struct Service<N, S, F, V, L> {
    config_path: PathBuf,
    ops: Ops<N, S, F, V>,
    lists: L,
    manager: Arc<RoutingConfigManager<N, S, F, V>>,
    /// Protects only the running/cancel/done/snapshot tuple. `stop`
    /// deliberately drops it before waiting on `done`, so "is the
    /// service running?" probes never block behind the loop.
    state: Mutex<ServiceState>,
    max_restarts: Option<u32>,
}

impl<N, S, F, V, L> Service<N, S, F, V, L>
where
    N: NetlinkOps + Send + Sync + 'static,
    S: IpsetOps + Send + Sync + 'static,
    F: IptablesOps + Clone + Send + Sync + 'static,
    V: InventoryOps + Clone + Send + Sync + 'static,
    L: ListOps + Clone + Send + Sync + 'static,
{
    pub fn new(config_path: PathBuf, ops: Ops<N, S, F, V>, lists: L, max_restarts: Option<u32>) -> Self {
        let manager = Arc::new(RoutingConfigManager::new(ops.clone()));
        Self {
            config_path,
            ops,
            lists,
            manager,
            state: Mutex::new(ServiceState::default()),
            max_restarts,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.state.lock().unwrap().fingerprint.clone()
    }

    pub fn snapshot(&self) -> Option<Arc<Config>> {
        self.state.lock().unwrap().snapshot.clone()
    }

    pub async fn installed_egress(&self) -> std::collections::HashMap<String, String> {
        self.manager.installed_egress().await
    }

    /// Load and validate the configuration, bring the kernel to the
    /// desired state, then hand off to the reconciliation loop.
    pub async fn start(&self) -> Result<(), Error> {
        {
            // claim the running slot, then release the lock before any of
            // the long-running startup work
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Err(Error::AlreadyRunning);
            }
            state.running = true;
        }
        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.lock().unwrap().running = false;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), Error> {
        let config = Arc::new(config::read(&self.config_path).await?);
        let fp = fingerprint::compute(&config, &self.lists).await?;

        if let Err(error) = self.lists.download(&config.lists).await {
            tracing::warn!(%error, "list download failed, using stale files");
        }
        bulk_load_all(&self.ops.ipset, &self.lists, &config).await?;

        self.manager.apply_persistent(&config).await?;
        self.manager.sync_routing(&config, true).await?;

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let (signal_tx, signal_rx) = mpsc::channel(8);
        {
            let mut state = self.state.lock().unwrap();
            state.cancel = Some(cancel.clone());
            state.done = Some(done_rx);
            state.snapshot = Some(Arc::clone(&config));
            state.fingerprint = Some(fp);
            state.signal_tx = Some(signal_tx);
        }

        let manager = Arc::clone(&self.manager);
        let ipset_ops = self.ops.ipset.clone();
        let lists = self.lists.clone();
        let max_restarts = self.max_restarts;
        let signal_rx = Arc::new(tokio::sync::Mutex::new(signal_rx));
        tokio::spawn(async move {
            run_with_restarts(cancel.clone(), max_restarts, || {
                run_loop(
                    Arc::clone(&manager),
                    ipset_ops.clone(),
                    lists.clone(),
                    Arc::clone(&config),
                    cancel.clone(),
                    Arc::clone(&signal_rx),
                )
            })
            .await;
            // dismantle with the snapshot this instance started with
            manager.undo(&config).await;
            let _ = done_tx.send(());
        });

        tracing::info!("service started");
        Ok(())
    }

    /// Publish cancellation, then wait for the loop to dismantle and
    /// acknowledge, bounded by [`STOP_TIMEOUT`].
    pub async fn stop(&self) -> Result<(), Error> {
        let (cancel, done) = {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                return Err(Error::NotRunning);
            }
            let cancel = state.cancel.take().ok_or(Error::NotRunning)?;
            let done = state.done.take().ok_or(Error::NotRunning)?;
            state.signal_tx = None;
            (cancel, done)
        };

        cancel.cancel();
        let outcome = tokio::time::timeout(STOP_TIMEOUT, done).await;

        {
            let mut state = self.state.lock().unwrap();
            state.running = false;
            state.snapshot = None;
            state.fingerprint = None;
        }

        match outcome {
            Ok(_) => {
                tracing::info!("service stopped");
                Ok(())
            }
            Err(_) => Err(Error::StopTimeout),
        }
    }

    /// Validate the fresh configuration before the previous instance's
    /// cleanup, then swap instances.
    pub async fn restart(&self) -> Result<(), Error> {
        config::read(&self.config_path).await?;
        match self.stop().await {
            Ok(()) | Err(Error::NotRunning) => {}
            Err(e) => return Err(e),
        }
        self.start().await
    }

    /// Ask the loop to re-run the persistent reconciler and then an
    /// unconditional routing pass.
    pub async fn reload(&self) -> Result<(), Error> {
        self.send_signal(LoopSignal::Reload).await
    }

    /// Ask the loop for an unconditional routing pass only.
    pub async fn refresh_routing(&self) -> Result<(), Error> {
        self.send_signal(LoopSignal::RefreshRouting).await
    }

    async fn send_signal(&self, signal: LoopSignal) -> Result<(), Error> {
        let tx = self
            .state
            .lock()
            .unwrap()
            .signal_tx
            .clone()
            .ok_or(Error::NotRunning)?;
        tx.send(signal).await.map_err(|_| Error::NotRunning)
    }

    /// Non-mutating self-check against the frozen snapshot.
    pub async fn self_check(&self) -> Result<Vec<CheckReport>, Error> {
        let snapshot = self.snapshot().ok_or(Error::NotRunning)?;
        Ok(self.manager.check(&snapshot).await)
    }

    /// Re-download lists and re-bulk-load every ipset, on demand.
    pub async fn download_lists(&self) -> Result<(), Error> {
        let snapshot = self.snapshot().ok_or(Error::NotRunning)?;
        if let Err(error) = self.lists.download(&snapshot.lists).await {
            tracing::warn!(%error, "list download failed, using stale files");
        }
        bulk_load_all(&self.ops.ipset, &self.lists, &snapshot).await
    }

    /// Dispatch one control-surface command. Errors become error
    /// responses; the surface never takes the daemon down.
    pub async fn handle_command(&self, cmd: Command) -> Response {
        match cmd {
            Command::Status => {
                let egress = self.installed_egress().await;
                let mut ipsets: Vec<IpsetStatus> = egress
                    .into_iter()
                    .map(|(name, interface)| IpsetStatus {
                        name,
                        chosen_interface: if interface.is_empty() { None } else { Some(interface) },
                    })
                    .collect();
                ipsets.sort_by(|a, b| a.name.cmp(&b.name));
                Response::Status(StatusResponse {
                    running: self.is_running(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    fingerprint: self.fingerprint(),
                    ipsets,
                })
            }
            Command::Check => match self.self_check().await {
                Ok(reports) => Response::Check(reports),
                Err(e) => Response::Error(e.to_string()),
            },
            Command::Reload => match self.reload().await {
                Ok(()) => Response::Reloaded,
                Err(e) => Response::Error(e.to_string()),
            },
            Command::RefreshRouting => match self.refresh_routing().await {
                Ok(()) => Response::RoutingRefreshed,
                Err(e) => Response::Error(e.to_string()),
            },
            Command::Fingerprint => Response::Fingerprint(self.fingerprint()),
            Command::DownloadLists => match self.download_lists().await {
                Ok(()) => Response::ListsDownloaded,
                Err(e) => Response::Error(e.to_string()),
            },
        }
    }
}

/// Populate every ipset from its lists.
async fn bulk_load_all<S: IpsetOps, L: ListOps>(ipset: &S, lists: &L, config: &Config) -> Result<(), Error> {
    for spec in &config.ipsets {
        ipset.create_if_not_exists(&spec.name, spec.family).await?;
        let entries = lists.load(&config.lists, &spec.lists).await?;
        let report = ipset
            .bulk_insert(&spec.name, spec.family, spec.flush_before_apply, &entries)
            .await?;
        tracing::info!(
            ipset = %spec.name,
            inserted = report.inserted,
            filtered = report.filtered,
            invalid = report.invalid,
            "ipset loaded"
        );
    }
    Ok(())
}

async fn maybe_tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn make_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// One incarnation of the service loop. Returns `Ok` only on observed
/// cancellation; errors bubble to the crash runner.
async fn run_loop<N, S, F, V, L>(
    manager: Arc<RoutingConfigManager<N, S, F, V>>,
    ipset_ops: S,
    lists: L,
    config: Arc<Config>,
    cancel: CancellationToken,
    signal_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<LoopSignal>>>,
) -> Result<(), Error>
where
    N: NetlinkOps,
    S: IpsetOps,
    F: IptablesOps + Clone,
    V: InventoryOps + Clone,
    L: ListOps,
{
    let mut signal_rx = signal_rx.lock().await;
    let mut tick = make_interval(config.general.tick_interval);
    let mut update = config.general.update_interval.map(make_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("service loop observed cancellation");
                return Ok(());
            }
            _ = tick.tick() => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                manager.sync_routing(&config, false).await?;
            }
            _ = maybe_tick(update.as_mut()) => {
                tracing::info!("auto-update: re-downloading lists");
                if let Err(error) = lists.download(&config.lists).await {
                    tracing::warn!(%error, "auto-update download failed, keeping current sets");
                    continue;
                }
                bulk_load_all(&ipset_ops, &lists, &config).await?;
            }
            Some(signal) = signal_rx.recv() => match signal {
                LoopSignal::Reload => {
                    tracing::info!("reload: re-applying persistent config and routing");
                    manager.apply_persistent(&config).await?;
                    manager.sync_routing(&config, true).await?;
                }
                LoopSignal::RefreshRouting => {
                    tracing::info!("refresh: unconditional routing pass");
                    manager.sync_routing(&config, true).await?;
                }
            }
        }
    }
}

/// Crash-isolated runner: run `body` until it returns cleanly, restarting
/// it after panics and errors with exponential backoff. Cancellation is
/// observed both before and after the restart wait.
pub(crate) async fn run_with_restarts<B, Fut>(cancel: CancellationToken, max_restarts: Option<u32>, mut body: B)
where
    B: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), Error>>,
{
    let mut backoff = ExponentialBackoff {
        initial_interval: BACKOFF_INITIAL,
        max_interval: BACKOFF_MAX,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };
    let mut restarts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        match AssertUnwindSafe(body()).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(error)) => {
                tracing::error!(%error, "service loop failed");
            }
            Err(panic) => {
                tracing::error!(panic = %panic_message(&panic), "service loop panicked");
            }
        }

        restarts += 1;
        if let Some(max) = max_restarts
            && restarts > max
        {
            tracing::error!(restarts, "giving up on the service loop after too many restarts");
            return;
        }

        let wait = backoff.next_backoff().unwrap_or(BACKOFF_MAX);
        tracing::info!(wait = ?wait, restarts, "restarting service loop after backoff");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
impl<N, S, F, V, L> Service<N, S, F, V, L>
where
    N: NetlinkOps + Send + Sync + 'static,
    S: IpsetOps + Send + Sync + 'static,
    F: IptablesOps + Clone + Send + Sync + 'static,
    V: InventoryOps + Clone + Send + Sync + 'static,
    L: ListOps + Clone + Send + Sync + 'static,
{
    /// Pretend a loop is running without spawning one, for stop-path tests.
    fn inject_running(&self, cancel: CancellationToken, done: oneshot::Receiver<()>) {
        let mut state = self.state.lock().unwrap();
        state.running = true;
        state.cancel = Some(cancel);
        state.done = Some(done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Family;
    use crate::mocks::{MockInventoryOps, MockIpsetOps, MockIptablesOps, MockListOps, MockNetlinkOps, NetlinkState};
    use crate::netlink::LinkInfo;

    use std::path::Path;

    type TestService = Service<MockNetlinkOps, MockIpsetOps, MockIptablesOps, MockInventoryOps, MockListOps>;
    type TestOps = Ops<MockNetlinkOps, MockIpsetOps, MockIptablesOps, MockInventoryOps>;

    const CONFIG: &str = r#"
        [general]
        lists_dir = "/tmp/unused"
        tick_interval = "10s"

        [[list]]
        name = "hosts"
        entries = ["10.0.0.0/8"]

        [[ipset]]
        name = "vpn_a"
        family = "ipv4"
        lists = ["hosts"]

        [ipset.routing]
        interfaces = ["wg0", "wg1"]
        fwmark = 1
        table = 100
        priority = 100
    "#;

    fn write_config(dir: &Path, raw: &str) -> PathBuf {
        let path = dir.join("markroute.toml");
        std::fs::write(&path, raw).unwrap();
        path
    }

    fn test_ops() -> TestOps {
        let netlink = MockNetlinkOps::with_state(NetlinkState {
            links: vec![
                LinkInfo { index: 10, name: "wg0".into(), is_up: true },
                LinkInfo { index: 11, name: "wg1".into(), is_up: true },
            ],
            ..Default::default()
        });
        Ops {
            netlink,
            ipset: MockIpsetOps::new(),
            iptables: MockIptablesOps::new(),
            inventory: None,
        }
    }

    fn mixed_family_lists() -> MockListOps {
        MockListOps::with_contents(&[("hosts", &["10.0.0.0/8", "fd00::/64", "1.1.1.1", "2001:db8::1"])])
    }

    fn service(path: PathBuf, ops: &TestOps, lists: &MockListOps) -> TestService {
        Service::new(path, ops.clone(), lists.clone(), Some(3))
    }

    #[tokio::test]
    async fn start_populates_and_stop_restores_pre_start_state() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_config(dir.path(), CONFIG);
        let ops = test_ops();
        let lists = mixed_family_lists();
        let svc = service(path, &ops, &lists);

        svc.start().await?;
        assert!(svc.is_running());
        assert!(svc.fingerprint().is_some());
        assert_eq!(lists.download_count(), 1);

        // mixed-family list: only the v4 subset lands in the v4 set
        assert_eq!(ops.ipset.entries("vpn_a"), vec!["10.0.0.0/8", "1.1.1.1"]);
        assert_eq!(
            ops.ipset.state.lock().unwrap().sets["vpn_a"].family,
            Family::Ipv4
        );
        assert_eq!(ops.netlink.routes_in_table(100).len(), 2);
        assert_eq!(svc.installed_egress().await["vpn_a"], "wg0");

        svc.stop().await?;
        assert!(!svc.is_running());
        assert!(svc.fingerprint().is_none());
        assert!(ops.netlink.routes_in_table(100).is_empty());
        assert!(ops.netlink.state.lock().unwrap().rules.is_empty());
        assert!(ops.iptables.rules_in(Family::Ipv4, "mangle", "PREROUTING").is_empty());
        // the set survives, empty
        assert!(ops.ipset.state.lock().unwrap().sets.contains_key("vpn_a"));
        assert!(ops.ipset.entries("vpn_a").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn stop_cleans_up_the_frozen_snapshot_not_the_mutated_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_config(dir.path(), CONFIG);
        let ops = test_ops();
        let lists = mixed_family_lists();
        let svc = service(path.clone(), &ops, &lists);

        svc.start().await?;

        // rewrite the file on disk with a different ipset
        let mutated = CONFIG
            .replace("vpn_a", "vpn_b")
            .replace("table = 100", "table = 101")
            .replace("fwmark = 1", "fwmark = 2");
        std::fs::write(&path, mutated)?;

        svc.stop().await?;

        // what start created is gone; what the new file implies was never touched
        assert!(ops.netlink.routes_in_table(100).is_empty());
        assert!(ops.netlink.state.lock().unwrap().rules.is_empty());
        assert!(!ops.ipset.state.lock().unwrap().sets.contains_key("vpn_b"));
        Ok(())
    }

    #[tokio::test]
    async fn double_start_is_refused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_config(dir.path(), CONFIG);
        let ops = test_ops();
        let lists = mixed_family_lists();
        let svc = service(path, &ops, &lists);

        svc.start().await?;
        assert!(matches!(svc.start().await, Err(Error::AlreadyRunning)));
        svc.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn stop_without_start_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), CONFIG);
        let ops = test_ops();
        let lists = mixed_family_lists();
        let svc = service(path, &ops, &lists);

        assert!(matches!(svc.stop().await, Err(Error::NotRunning)));
    }

    #[tokio::test]
    async fn invalid_config_refuses_start() {
        let dir = tempfile::tempdir().unwrap();
        let invalid = CONFIG.replace("priority = 100", "priority = 100\n\n[[ipset]]\nname = \"vpn_b\"\nfamily = \"ipv4\"\n[ipset.routing]\ninterfaces = [\"wg0\"]\nfwmark = 1\ntable = 101\npriority = 101");
        let path = write_config(dir.path(), &invalid);
        let ops = test_ops();
        let lists = mixed_family_lists();
        let svc = service(path, &ops, &lists);

        assert!(matches!(svc.start().await, Err(Error::Config(_))));
        assert!(!svc.is_running());
        assert!(ops.netlink.routes_in_table(100).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_reports_timeout_when_the_loop_never_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), CONFIG);
        let ops = test_ops();
        let lists = mixed_family_lists();
        let svc = service(path, &ops, &lists);

        let (done_tx, done_rx) = oneshot::channel();
        svc.inject_running(CancellationToken::new(), done_rx);

        let outcome = svc.stop().await;
        assert!(matches!(outcome, Err(Error::StopTimeout)));
        drop(done_tx);
    }

    #[tokio::test]
    async fn download_failure_is_not_fatal_on_start() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_config(dir.path(), CONFIG);
        let ops = test_ops();
        let lists = mixed_family_lists();
        lists.fail_downloads();
        let svc = service(path, &ops, &lists);

        svc.start().await?;
        assert!(svc.is_running());
        svc.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn reload_signal_restores_persistent_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_config(dir.path(), CONFIG);
        let ops = test_ops();
        let lists = mixed_family_lists();
        let svc = service(path, &ops, &lists);

        svc.start().await?;
        // someone flushed our policy rule behind our back
        ops.netlink.state.lock().unwrap().rules.clear();

        svc.reload().await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(ops.netlink.state.lock().unwrap().rules.len(), 1);
        svc.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn refresh_routing_signal_reconverges_routes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_config(dir.path(), CONFIG);
        let ops = test_ops();
        let lists = mixed_family_lists();
        let svc = service(path, &ops, &lists);

        svc.start().await?;
        // drop the interface route; the egress is unchanged so only an
        // unconditional pass puts it back
        let iface_route = ops
            .netlink
            .routes_in_table(100)
            .into_iter()
            .find(|r| !r.blackhole)
            .unwrap();
        ops.netlink.route_del(&iface_route).await?;

        svc.refresh_routing().await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(ops.netlink.routes_in_table(100).len(), 2);
        svc.stop().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn auto_update_redownloads_and_reloads_sets() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let raw = CONFIG.replace("tick_interval = \"10s\"", "tick_interval = \"10s\"\nupdate_interval = \"1s\"");
        let path = write_config(dir.path(), &raw);
        let ops = test_ops();
        let lists = mixed_family_lists();
        let svc = service(path, &ops, &lists);

        svc.start().await?;
        assert_eq!(lists.download_count(), 1);

        // let the loop task initialize its tickers before moving the clock
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_millis(1100)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert_eq!(lists.download_count(), 2);
        svc.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn self_check_reports_ok_after_start() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_config(dir.path(), CONFIG);
        let ops = test_ops();
        let lists = mixed_family_lists();
        let svc = service(path, &ops, &lists);

        svc.start().await?;
        let reports = svc.self_check().await?;
        assert!(!reports.is_empty());
        assert!(reports.iter().all(|r| r.status == crate::component::CheckStatus::Ok));
        svc.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn restart_validates_fresh_config_before_dismantling() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_config(dir.path(), CONFIG);
        let ops = test_ops();
        let lists = mixed_family_lists();
        let svc = service(path.clone(), &ops, &lists);

        svc.start().await?;
        std::fs::write(&path, "not even toml")?;

        assert!(matches!(svc.restart().await, Err(Error::Config(_))));
        // the running instance is untouched
        assert!(svc.is_running());
        assert_eq!(ops.netlink.routes_in_table(100).len(), 2);
        svc.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn control_surface_reflects_service_state() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_config(dir.path(), CONFIG);
        let ops = test_ops();
        let lists = mixed_family_lists();
        let svc = service(path, &ops, &lists);

        svc.start().await?;
        match svc.handle_command(Command::Status).await {
            Response::Status(status) => {
                assert!(status.running);
                assert!(status.fingerprint.is_some());
                assert_eq!(status.ipsets.len(), 1);
                assert_eq!(status.ipsets[0].name, "vpn_a");
                assert_eq!(status.ipsets[0].chosen_interface.as_deref(), Some("wg0"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(matches!(
            svc.handle_command(Command::Check).await,
            Response::Check(_)
        ));

        svc.stop().await?;
        match svc.handle_command(Command::Status).await {
            Response::Status(status) => {
                assert!(!status.running);
                assert!(status.fingerprint.is_none());
            }
            other => panic!("unexpected response: {other:?}"),
        }
        // commands that need a running instance degrade to error responses
        assert!(matches!(
            svc.handle_command(Command::Check).await,
            Response::Error(_)
        ));
        Ok(())
    }

    // ====================================================================
    // Crash runner
    // ====================================================================

    #[tokio::test(start_paused = true)]
    async fn runner_restarts_after_errors_until_clean_exit() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);

        run_with_restarts(CancellationToken::new(), None, move || {
            let counter = Arc::clone(&counter);
            async move {
                let mut n = counter.lock().unwrap();
                *n += 1;
                if *n < 3 { Err(Error::NotRunning) } else { Ok(()) }
            }
        })
        .await;

        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn runner_catches_panics() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);

        run_with_restarts(CancellationToken::new(), None, move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = {
                    let mut n = counter.lock().unwrap();
                    *n += 1;
                    *n
                };
                if n == 1 {
                    panic!("simulated loop panic");
                }
                Ok(())
            }
        })
        .await;

        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn runner_gives_up_after_max_restarts() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);

        run_with_restarts(CancellationToken::new(), Some(2), move || {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock().unwrap() += 1;
                Err(Error::NotRunning)
            }
        })
        .await;

        // one initial run plus two restarts
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn runner_observes_cancellation_during_backoff() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let inner_cancel = cancel.clone();

        run_with_restarts(cancel, None, move || {
            let counter = Arc::clone(&counter);
            let cancel = inner_cancel.clone();
            async move {
                *counter.lock().unwrap() += 1;
                // cancellation arrives while the runner sits in backoff
                cancel.cancel();
                Err(Error::NotRunning)
            }
        })
        .await;

        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
