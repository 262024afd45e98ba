//! Wrapper around the `ipset` helper binary.
//!
//! Two invocation modes: single commands (`create`, `flush`, `destroy`,
//! `list -n`, `add`) and the batched `restore -exist` mode fed
//! newline-delimited lines on standard input. Sets are always created with
//! a timeout slot so dynamically-added entries may carry a TTL while
//! permanent entries use timeout 0.

use async_trait::async_trait;
use cidr::IpCidr;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;

use crate::config::Family;

pub const DEFAULT_BINARY: &str = "ipset";

/// Consecutive invalid entries tolerated before a bulk insert aborts.
const MAX_CONSECUTIVE_FAILURES: usize = 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ipset helper binary not installed")]
    NotInstalled,
    #[error("ipset helper failed: {0}")]
    Backend(String),
    #[error("invalid entry `{0}`")]
    Invalid(String),
    #[error("aborted bulk insert after {0} consecutive invalid entries")]
    TooManyFailures(usize),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Outcome counts of one bulk insertion.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BulkReport {
    pub inserted: usize,
    /// Valid entries of the wrong family, silently filtered.
    pub filtered: usize,
    /// Malformed entries, logged and skipped.
    pub invalid: usize,
}

// ============================================================================
// Trait
// ============================================================================

#[async_trait]
pub trait IpsetOps: Send + Sync + Clone {
    /// Idempotent create; the set always carries a timeout slot.
    async fn create_if_not_exists(&self, name: &str, family: Family) -> Result<(), Error>;
    async fn flush(&self, name: &str) -> Result<(), Error>;
    async fn destroy(&self, name: &str) -> Result<(), Error>;
    async fn is_exists(&self, name: &str) -> Result<bool, Error>;
    /// Single-entry insert with a per-entry timeout.
    async fn add_with_ttl(&self, name: &str, entry: &IpCidr, ttl_seconds: u32) -> Result<(), Error>;
    /// Batched insertion of raw list entries. Entries whose family does
    /// not match are silently filtered; malformed entries are logged and
    /// skipped; more than [`MAX_CONSECUTIVE_FAILURES`] consecutive
    /// failures abort the batch.
    async fn bulk_insert(
        &self,
        name: &str,
        family: Family,
        flush_first: bool,
        entries: &[String],
    ) -> Result<BulkReport, Error>;
}

// ============================================================================
// Entry filtering (shared with the mock substrate)
// ============================================================================

/// Parse and family-filter raw list entries, enforcing the
/// consecutive-failure abort. Bare addresses are accepted as host CIDRs
/// and host bits are ignored.
pub(crate) fn filter_entries(family: Family, entries: &[String]) -> Result<(Vec<IpCidr>, BulkReport), Error> {
    let mut report = BulkReport::default();
    let mut kept = Vec::with_capacity(entries.len());
    let mut consecutive = 0usize;

    for raw in entries {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match cidr::parsers::parse_cidr_ignore_hostbits::<IpCidr, _>(raw, IpAddr::from_str) {
            Ok(parsed) => {
                let matches = match parsed {
                    IpCidr::V4(_) => family == Family::Ipv4,
                    IpCidr::V6(_) => family == Family::Ipv6,
                };
                if matches {
                    consecutive = 0;
                    report.inserted += 1;
                    kept.push(parsed);
                } else {
                    report.filtered += 1;
                }
            }
            Err(parse_err) => {
                tracing::warn!(entry = raw, error = %parse_err, "skipping invalid list entry");
                report.invalid += 1;
                consecutive += 1;
                if consecutive > MAX_CONSECUTIVE_FAILURES {
                    return Err(Error::TooManyFailures(consecutive));
                }
            }
        }
    }

    Ok((kept, report))
}

// ============================================================================
// Real Implementation
// ============================================================================

#[derive(Clone)]
pub struct RealIpsetOps {
    binary: PathBuf,
}

impl Default for RealIpsetOps {
    fn default() -> Self {
        Self::new()
    }
}

impl RealIpsetOps {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_BINARY),
        }
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, Error> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(map_spawn_error)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Backend(format!(
                "ipset {}: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

fn map_spawn_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotInstalled
    } else {
        Error::IO(e)
    }
}

#[async_trait]
impl IpsetOps for RealIpsetOps {
    async fn create_if_not_exists(&self, name: &str, family: Family) -> Result<(), Error> {
        self.run(&[
            "create",
            name,
            "hash:net",
            "family",
            family.ipset_arg(),
            "timeout",
            "0",
            "-exist",
        ])
        .await?;
        tracing::debug!("ipset create {name} hash:net family {} timeout 0 -exist", family.ipset_arg());
        Ok(())
    }

    async fn flush(&self, name: &str) -> Result<(), Error> {
        self.run(&["flush", name]).await?;
        tracing::debug!("ipset flush {name}");
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<(), Error> {
        self.run(&["destroy", name]).await?;
        tracing::debug!("ipset destroy {name}");
        Ok(())
    }

    async fn is_exists(&self, name: &str) -> Result<bool, Error> {
        let output = Command::new(&self.binary)
            .args(["list", "-n", name])
            .output()
            .await
            .map_err(map_spawn_error)?;
        Ok(output.status.success())
    }

    async fn add_with_ttl(&self, name: &str, entry: &IpCidr, ttl_seconds: u32) -> Result<(), Error> {
        self.run(&[
            "add",
            name,
            &entry.to_string(),
            "timeout",
            &ttl_seconds.to_string(),
            "-exist",
        ])
        .await?;
        Ok(())
    }

    async fn bulk_insert(
        &self,
        name: &str,
        family: Family,
        flush_first: bool,
        entries: &[String],
    ) -> Result<BulkReport, Error> {
        let (kept, report) = filter_entries(family, entries)?;

        let mut child = Command::new(&self.binary)
            .args(["restore", "-exist"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(map_spawn_error)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Backend("restore helper has no stdin handle".into()))?;

        let set_name = name.to_string();
        let writer = tokio::spawn(async move {
            if flush_first {
                stdin.write_all(format!("flush {set_name}\n").as_bytes()).await?;
            }
            for entry in &kept {
                stdin
                    .write_all(format!("add {set_name} {entry} timeout 0\n").as_bytes())
                    .await?;
            }
            // close the helper's input; the caller must not wait on the
            // helper before this happens or both sides deadlock
            stdin.shutdown().await?;
            drop(stdin);
            Ok::<(), std::io::Error>(())
        });

        let write_result = writer
            .await
            .map_err(|e| Error::Backend(format!("restore writer task failed: {e}")))?;
        let output = child.wait_with_output().await?;
        write_result?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Backend(format!("ipset restore: {}", stderr.trim())));
        }

        tracing::debug!(
            set = name,
            inserted = report.inserted,
            filtered = report.filtered,
            invalid = report.invalid,
            "ipset restore -exist"
        );
        Ok(report)
    }
}
