//! Commands accepted over the control socket and their responses.

use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};

use crate::component::CheckReport;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Status,
    Check,
    Reload,
    RefreshRouting,
    Fingerprint,
    DownloadLists,
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Status => write!(f, "status"),
            Command::Check => write!(f, "check"),
            Command::Reload => write!(f, "reload"),
            Command::RefreshRouting => write!(f, "refresh-routing"),
            Command::Fingerprint => write!(f, "fingerprint"),
            Command::DownloadLists => write!(f, "download-lists"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Status(StatusResponse),
    Check(Vec<CheckReport>),
    Reloaded,
    RoutingRefreshed,
    Fingerprint(Option<String>),
    ListsDownloaded,
    Error(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub running: bool,
    pub version: String,
    pub fingerprint: Option<String>,
    pub ipsets: Vec<IpsetStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IpsetStatus {
    pub name: String,
    /// Egress currently installed; `None` means blackhole/gateway only.
    pub chosen_interface: Option<String>,
}
