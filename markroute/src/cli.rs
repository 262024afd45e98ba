use clap::Parser;

use std::path::PathBuf;

use markroute_lib::{config, ipset, socket};

/// Policy-based routing service: directs traffic for configured domains
/// and networks through alternate egress interfaces
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Socket path for communication with this service
    #[arg(
        short,
        long,
        env = socket::ENV_VAR,
        default_value = socket::DEFAULT_PATH
    )]
    pub socket_path: PathBuf,

    /// General configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH,
    )]
    pub config_path: PathBuf,

    /// Path to the ipset helper binary
    #[arg(long, default_value = ipset::DEFAULT_BINARY)]
    pub ipset_binary: PathBuf,

    /// Give up restarting the reconciliation loop after this many crashes
    /// (default: retry forever)
    #[arg(long)]
    pub max_restarts: Option<u32>,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli_with_minimum_arguments() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["markroute"])?;
        assert_eq!(args.config_path, PathBuf::from(config::DEFAULT_PATH));
        assert!(args.max_restarts.is_none());
        Ok(())
    }

    #[test]
    fn parses_overrides() -> anyhow::Result<()> {
        let args = Cli::try_parse_from([
            "markroute",
            "--config-path",
            "/tmp/markroute.toml",
            "--max-restarts",
            "5",
        ])?;
        assert_eq!(args.config_path, PathBuf::from("/tmp/markroute.toml"));
        assert_eq!(args.max_restarts, Some(5));
        Ok(())
    }
}
