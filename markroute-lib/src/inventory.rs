//! Router-platform inventory client.
//!
//! Answers "is interface X logically connected?" from the platform's HTTP
//! API. The engine treats the whole facility as best-effort: a missing,
//! slow or partial inventory must never stall or misdirect reconciliation,
//! so callers degrade failures to an empty map.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashMap;
use std::time::Duration;

/// Budget for one inventory call.
pub const INVENTORY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum Error {
    #[error("inventory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("inventory unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceStatus {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub connected: String,
    #[serde(default)]
    pub link: String,
}

impl InterfaceStatus {
    /// Only an explicit negative disqualifies a candidate. An empty or
    /// missing `connected` field is unknown and therefore usable; partial
    /// inventory data must not cause egress churn.
    pub fn is_disconnected(&self) -> bool {
        self.connected == "no"
    }
}

#[async_trait]
pub trait InventoryOps: Send + Sync {
    /// System interface name → status.
    async fn get_interfaces(&self) -> Result<HashMap<String, InterfaceStatus>, Error>;
}

/// Production client querying the platform API over HTTP.
#[derive(Clone)]
pub struct RealInventoryClient {
    http: reqwest::Client,
    url: url::Url,
}

impl RealInventoryClient {
    pub fn new(url: url::Url) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(INVENTORY_TIMEOUT).build()?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl InventoryOps for RealInventoryClient {
    async fn get_interfaces(&self) -> Result<HashMap<String, InterfaceStatus>, Error> {
        let response = self.http.get(self.url.clone()).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}
