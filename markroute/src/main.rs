use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use std::path::Path;
use std::process;
use std::sync::Arc;

use markroute_lib::command::Command;
use markroute_lib::component::Ops;
use markroute_lib::config;
use markroute_lib::inventory::RealInventoryClient;
use markroute_lib::ipset::RealIpsetOps;
use markroute_lib::iptables::RealIptablesOps;
use markroute_lib::lists::FileListStore;
use markroute_lib::netlink::RealNetlinkOps;
use markroute_lib::service::{self, Service};
use markroute_lib::{logging, socket};

mod cli;

type Daemon = Service<RealNetlinkOps, RealIpsetOps, RealIptablesOps, RealInventoryClient, FileListStore>;

enum SignalMessage {
    Shutdown,
    Reload,
    RefreshRouting,
}

async fn signal_channel() -> Result<mpsc::Receiver<SignalMessage>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(32);
    let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;
    let mut sigusr1 = signal(SignalKind::user_defined1()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGUSR1 handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = sigint.recv() => {
                    tracing::debug!("received SIGINT");
                    if sender.send(SignalMessage::Shutdown).await.is_err() {
                        break;
                    }
                },
                Some(_) = sigterm.recv() => {
                    tracing::debug!("received SIGTERM");
                    if sender.send(SignalMessage::Shutdown).await.is_err() {
                        break;
                    }
                },
                Some(_) = sighup.recv() => {
                    tracing::debug!("received SIGHUP");
                    if sender.send(SignalMessage::Reload).await.is_err() {
                        break;
                    }
                },
                Some(_) = sigusr1.recv() => {
                    tracing::debug!("received SIGUSR1");
                    if sender.send(SignalMessage::RefreshRouting).await.is_err() {
                        break;
                    }
                }
                else => {
                    tracing::warn!("signal streams closed");
                    break;
                }
            }
        }
    });

    Ok(receiver)
}

async fn socket_listener(socket_path: &Path) -> Result<UnixListener, exitcode::ExitCode> {
    match socket_path.try_exists() {
        Ok(true) => {
            tracing::info!("probing for running instance");
            match socket::process_cmd(socket_path, &Command::Status).await {
                Ok(_) => {
                    tracing::error!("service is already running - cannot start another instance");
                    return Err(exitcode::TEMPFAIL);
                }
                Err(e) => {
                    tracing::debug!(warn = ?e, "done probing for running instance");
                }
            };
            fs::remove_file(socket_path).await.map_err(|e| {
                tracing::error!(error = ?e, "error removing stale socket file");
                exitcode::IOERR
            })?;
        }
        Ok(false) => (),
        Err(e) => {
            tracing::error!(error = ?e, "error checking socket path");
            return Err(exitcode::IOERR);
        }
    };

    if let Some(socket_dir) = socket_path.parent() {
        fs::create_dir_all(socket_dir).await.map_err(|e| {
            tracing::error!(error = %e, "error creating socket directory");
            exitcode::IOERR
        })?;
    }

    UnixListener::bind(socket_path).map_err(|e| {
        tracing::error!(error = ?e, "error binding socket");
        exitcode::OSFILE
    })
}

async fn build_service(args: &cli::Cli) -> Result<Daemon, exitcode::ExitCode> {
    // one bootstrap read for the pieces that configure the collaborators;
    // the service re-reads and freezes its own snapshot on every start
    let bootstrap = config::read(&args.config_path).await.map_err(|error| {
        tracing::error!(?error, "unable to read configuration file");
        exitcode::NOINPUT
    })?;

    let (conn, handle, _) = rtnetlink::new_connection().map_err(|error| {
        tracing::error!(?error, "unable to open netlink connection");
        exitcode::OSERR
    })?;
    tokio::spawn(conn);
    let netlink = RealNetlinkOps::new(handle);

    let iptables = RealIptablesOps::new().map_err(|error| {
        tracing::error!(?error, "iptables unavailable");
        exitcode::UNAVAILABLE
    })?;

    let inventory = match &bootstrap.general.inventory_url {
        Some(url) => Some(RealInventoryClient::new(url.clone()).map_err(|error| {
            tracing::error!(?error, "unable to build inventory client");
            exitcode::UNAVAILABLE
        })?),
        None => None,
    };

    let ops = Ops {
        netlink,
        ipset: RealIpsetOps::with_binary(args.ipset_binary.clone()),
        iptables,
        inventory,
    };
    let lists = FileListStore::new(bootstrap.general.lists_dir.clone());

    Ok(Service::new(args.config_path.clone(), ops, lists, args.max_restarts))
}

async fn handle_connection(service: Arc<Daemon>, mut stream: UnixStream) {
    let mut raw = String::new();
    if let Err(error) = stream.read_to_string(&mut raw).await {
        tracing::error!(?error, "error reading from control socket");
        return;
    }

    let cmd: Command = match serde_json::from_str(&raw) {
        Ok(cmd) => cmd,
        Err(error) => {
            tracing::error!(%error, %raw, "error parsing control command");
            return;
        }
    };
    tracing::debug!(command = %cmd, "incoming control command");

    let resp = service.handle_command(cmd).await;
    let serialized = match serde_json::to_string(&resp) {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "error serializing response");
            return;
        }
    };
    if let Err(error) = stream.write_all(serialized.as_bytes()).await {
        tracing::error!(?error, "error writing response to control socket");
    }
}

async fn daemon(args: cli::Cli) -> Result<(), exitcode::ExitCode> {
    let mut signal_receiver = signal_channel().await?;
    let socket_path = args.socket_path.clone();
    let listener = socket_listener(&socket_path).await?;

    let service = Arc::new(build_service(&args).await?);

    if let Err(error) = service.start().await {
        tracing::error!(%error, "unable to start routing service");
        let _ = fs::remove_file(&socket_path).await;
        return Err(match error {
            service::Error::Config(_) => exitcode::CONFIG,
            _ => exitcode::UNAVAILABLE,
        });
    }

    tracing::info!("entering main daemon loop");
    let result = loop {
        tokio::select! {
            Some(signal) = signal_receiver.recv() => match signal {
                SignalMessage::Shutdown => {
                    tracing::info!("initiating shutdown");
                    match service.stop().await {
                        Ok(()) => break Ok(()),
                        Err(error) => {
                            tracing::error!(%error, "error stopping service");
                            break Err(exitcode::SOFTWARE);
                        }
                    }
                }
                SignalMessage::Reload => {
                    if let Err(error) = service.reload().await {
                        tracing::error!(%error, "reload failed");
                    }
                }
                SignalMessage::RefreshRouting => {
                    if let Err(error) = service.refresh_routing().await {
                        tracing::error!(%error, "routing refresh failed");
                    }
                }
            },
            Ok((stream, _addr)) = listener.accept() => {
                tokio::spawn(handle_connection(Arc::clone(&service), stream));
            }
            else => {
                tracing::error!("unexpected channel closure");
                break Err(exitcode::IOERR);
            }
        }
    };

    if let Err(error) = fs::remove_file(&socket_path).await {
        tracing::warn!(%error, "failed removing socket on shutdown");
    }
    result
}

#[tokio::main]
async fn main() {
    let args = cli::parse();

    logging::init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    match daemon(args).await {
        Ok(()) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}
