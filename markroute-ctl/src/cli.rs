use clap::{Parser, Subcommand};

use std::path::PathBuf;

use markroute_lib::command::Command;
use markroute_lib::socket;

/// Control client for the markroute routing service
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Socket path of the running service
    #[arg(
        short,
        long,
        env = socket::ENV_VAR,
        default_value = socket::DEFAULT_PATH
    )]
    pub socket_path: PathBuf,

    /// Print the raw JSON response
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: CtlCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum CtlCommand {
    /// Service state, fingerprint and chosen egress per ipset
    Status,
    /// Compare every managed kernel object against its desired state
    Check,
    /// Re-apply persistent config, then an unconditional routing pass
    Reload,
    /// Unconditional routing pass only
    RefreshRouting,
    /// Print the active-config fingerprint
    Fingerprint,
    /// Re-download lists and re-populate the sets
    DownloadLists,
}

impl From<CtlCommand> for Command {
    fn from(cmd: CtlCommand) -> Self {
        match cmd {
            CtlCommand::Status => Command::Status,
            CtlCommand::Check => Command::Check,
            CtlCommand::Reload => Command::Reload,
            CtlCommand::RefreshRouting => Command::RefreshRouting,
            CtlCommand::Fingerprint => Command::Fingerprint,
            CtlCommand::DownloadLists => Command::DownloadLists,
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
