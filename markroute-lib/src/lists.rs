//! List ingestion: download remote lists into the list store and load raw
//! entries for bulk insertion.
//!
//! Downloads are best-effort. A failed fetch leaves the previously
//! materialized file in place and the stale contents keep being served;
//! the engine never refuses to start because a list server is down.

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;

use std::path::{Path, PathBuf};

use crate::config::ListSource;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("download error: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait ListOps: Send + Sync + Clone {
    /// Fetch every remote list once. Individual failures are logged and
    /// swallowed so stale files keep being used.
    async fn download(&self, lists: &[ListSource]) -> Result<(), Error>;
    /// Raw entries of the named lists, comments and blanks stripped.
    async fn load(&self, lists: &[ListSource], names: &[String]) -> Result<Vec<String>, Error>;
}

/// File-backed list store rooted at the configured lists directory.
#[derive(Clone)]
pub struct FileListStore {
    dir: PathBuf,
    http: reqwest::Client,
}

impl FileListStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            http: reqwest::Client::new(),
        }
    }

    fn list_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lst"))
    }

    async fn fetch_into_store(&self, source: &ListSource, url: &url::Url) -> Result<(), Error> {
        let body = self
            .http
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        // write-then-rename so a crashed download never truncates the
        // previous materialization
        let target = self.list_path(&source.name);
        let tmp = target.with_extension("lst.tmp");
        fs::write(&tmp, body.as_bytes()).await?;
        fs::rename(&tmp, &target).await?;
        tracing::info!(list = %source.name, size = body.len(), "list downloaded");
        Ok(())
    }
}

fn strip(lines: &str) -> impl Iterator<Item = &str> {
    lines
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

#[async_trait]
impl ListOps for FileListStore {
    async fn download(&self, lists: &[ListSource]) -> Result<(), Error> {
        fs::create_dir_all(&self.dir).await?;

        for source in lists {
            match &source.url {
                Some(url) => {
                    if let Err(error) = self.fetch_into_store(source, url).await {
                        tracing::warn!(list = %source.name, %error, "list download failed, keeping stale file");
                    }
                }
                None => {
                    // materialize inline entries through the same store so
                    // the fingerprint and bulk-load read one shape of data
                    let target = self.list_path(&source.name);
                    fs::write(&target, source.entries.join("\n")).await?;
                }
            }
        }
        Ok(())
    }

    async fn load(&self, lists: &[ListSource], names: &[String]) -> Result<Vec<String>, Error> {
        let mut entries = Vec::new();
        for name in names {
            let source = lists.iter().find(|l| &l.name == name);
            let path = self.list_path(name);
            match fs::read_to_string(&path).await {
                Ok(content) => entries.extend(strip(&content).map(str::to_string)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // never downloaded; inline lists can still be served
                    match source {
                        Some(src) if !src.entries.is_empty() => {
                            entries.extend(src.entries.iter().cloned());
                        }
                        _ => {
                            tracing::warn!(list = %name, path = %path.display(), "list file missing, treating as empty");
                        }
                    }
                }
                Err(e) => return Err(Error::IO(e)),
            }
        }
        Ok(entries)
    }
}
