//! Active-config fingerprint.
//!
//! A deterministic digest over the configuration snapshot, the contents of
//! every list an ipset actually uses, and (when resolvable within a small
//! budget) the resolved addresses of the domain proxy. Exposed for
//! external equality checks only; reconciliation never consumes it.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::time::timeout;

use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::Config;
use crate::lists::{self, ListOps};

/// Budget for the proxy-address resolution probe.
pub const DNS_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("list error: {0}")]
    Lists(#[from] lists::Error),
}

pub async fn compute<L: ListOps>(config: &Config, lists: &L) -> Result<String, Error> {
    let mut hasher = Sha256::new();

    hasher.update(serde_json::to_vec(config)?);

    // only lists an ipset references contribute, in stable order
    let used: BTreeSet<&str> = config
        .ipsets
        .iter()
        .flat_map(|ipset| ipset.lists.iter().map(String::as_str))
        .collect();
    for name in used {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        let entries = lists.load(&config.lists, &[name.to_string()]).await?;
        for entry in entries {
            hasher.update(entry.as_bytes());
            hasher.update([b'\n']);
        }
    }

    if let Some(host) = config.general.dns_proxy_host()
        && let Ok(port) = config.general.dns_proxy_port()
    {
        match timeout(DNS_PROBE_TIMEOUT, lookup_host((host.as_str(), port))).await {
            Ok(Ok(addrs)) => {
                let mut resolved: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
                resolved.sort();
                for addr in resolved {
                    hasher.update(addr.as_bytes());
                    hasher.update([b'\n']);
                }
            }
            Ok(Err(error)) => {
                tracing::debug!(%error, "proxy address did not resolve, fingerprint omits it");
            }
            Err(_) => {
                tracing::debug!("proxy address resolution timed out, fingerprint omits it");
            }
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockListOps;

    fn config() -> Config {
        toml::from_str(
            r#"
            [general]
            lists_dir = "/tmp/lists"

            [[list]]
            name = "hosts"
            entries = ["10.0.0.0/8"]

            [[ipset]]
            name = "vpn_a"
            family = "ipv4"
            lists = ["hosts"]

            [ipset.routing]
            interfaces = ["wg0"]
            fwmark = 1
            table = 100
            priority = 100
        "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn identical_inputs_produce_identical_fingerprints() -> anyhow::Result<()> {
        let lists = MockListOps::with_contents(&[("hosts", &["10.0.0.0/8"])]);
        let a = compute(&config(), &lists).await?;
        let b = compute(&config(), &lists).await?;
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        Ok(())
    }

    #[tokio::test]
    async fn list_contents_change_the_fingerprint() -> anyhow::Result<()> {
        let before = MockListOps::with_contents(&[("hosts", &["10.0.0.0/8"])]);
        let after = MockListOps::with_contents(&[("hosts", &["10.0.0.0/8", "1.1.1.1"])]);
        let a = compute(&config(), &before).await?;
        let b = compute(&config(), &after).await?;
        assert_ne!(a, b);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_changes_the_fingerprint() -> anyhow::Result<()> {
        let lists = MockListOps::with_contents(&[("hosts", &["10.0.0.0/8"])]);
        let mut modified = config();
        modified.ipsets[0].routing.fwmark = 2;
        let a = compute(&config(), &lists).await?;
        let b = compute(&modified, &lists).await?;
        assert_ne!(a, b);
        Ok(())
    }

    #[tokio::test]
    async fn unreferenced_lists_do_not_contribute() -> anyhow::Result<()> {
        let mut cfg = config();
        cfg.lists.push(crate::config::ListSource {
            name: "unused".into(),
            url: None,
            entries: vec!["192.168.0.0/16".into()],
        });
        let lists = MockListOps::with_contents(&[("hosts", &["10.0.0.0/8"]), ("unused", &["192.168.0.0/16"])]);
        let base = compute(&config(), &lists).await?;

        // the extra declared-but-unused list changes the snapshot JSON but
        // its contents never feed the digest
        let with_unused = compute(&cfg, &lists).await?;
        let richer = MockListOps::with_contents(&[("hosts", &["10.0.0.0/8"]), ("unused", &["172.16.0.0/12"])]);
        let with_unused_other_content = compute(&cfg, &richer).await?;

        assert_ne!(base, with_unused);
        assert_eq!(with_unused, with_unused_other_content);
        Ok(())
    }
}
