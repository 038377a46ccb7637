//! On-disk layout of the durable queue
//!
//! ```text
//! <root>/
//!   w1/ … wN/              worker inboxes (closed files: events-<ulid>.log)
//!   failed/                quarantine
//!   staging/<producer>/    producer working folders (current.open, owner.lock)
//! ```
//!
//! Every hand-off between directories is a single `rename`, which is atomic
//! on one filesystem. Keep the whole root on one mount.
//!
//! A producer holds an exclusive lock on its `owner.lock` for as long as it
//! lives. A staging folder whose lock can be taken belongs to a producer
//! that died, and [`QueueLayout::recover_staging`] adopts its open file.

use crate::error::Result;
use crate::metrics;
use std::fs::TryLockError;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Suffix of a closed queue file waiting in an inbox
pub const CLOSED_SUFFIX: &str = ".log";
/// Suffix of a file a worker has claimed
pub const CLAIMED_SUFFIX: &str = ".log.claimed";
/// Name of the file a producer appends to
pub const OPEN_FILE: &str = "current.open";
/// Lock file held by the producer owning a staging folder
pub const OWNER_FILE: &str = "owner.lock";

const FAILED_DIR: &str = "failed";
const STAGING_DIR: &str = "staging";

/// Paths of a queue rooted at one directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLayout {
    root: PathBuf,
    workers: usize,
}

impl QueueLayout {
    pub fn new(root: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            root: root.into(),
            workers: workers.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Inbox of worker `index` (zero-based), e.g. `<root>/w1`
    pub fn inbox(&self, index: usize) -> PathBuf {
        self.root.join(format!("w{}", index % self.workers + 1))
    }

    pub fn inboxes(&self) -> Vec<PathBuf> {
        (0..self.workers).map(|i| self.inbox(i)).collect()
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.root.join(FAILED_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Create every directory of the layout
    pub async fn ensure(&self) -> Result<()> {
        for inbox in self.inboxes() {
            tokio::fs::create_dir_all(&inbox).await?;
        }
        tokio::fs::create_dir_all(self.failed_dir()).await?;
        tokio::fs::create_dir_all(self.staging_dir()).await?;
        Ok(())
    }

    /// Closed files waiting in any inbox
    pub async fn pending_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for inbox in self.inboxes() {
            files.extend(list_files(&inbox, CLOSED_SUFFIX).await?);
        }
        Ok(files)
    }

    pub async fn quarantined_files(&self) -> Result<Vec<PathBuf>> {
        list_files(&self.failed_dir(), CLOSED_SUFFIX).await
    }

    /// Move every quarantined file back into the inboxes, round-robin
    ///
    /// Workers never call this; it is an operator action. Returns the number
    /// of files moved.
    pub async fn replay_quarantine(&self) -> Result<usize> {
        self.ensure().await?;
        let files = self.quarantined_files().await?;

        for (index, file) in files.iter().enumerate() {
            let target = self.inbox(index).join(queue_file_name());
            tokio::fs::rename(file, &target).await?;
            debug!(from = %file.display(), to = %target.display(), "Replayed quarantined file");
            metrics::try_record_queue_file("replayed");
        }

        if !files.is_empty() {
            info!(count = files.len(), root = %self.root.display(), "Quarantine replayed");
        }
        Ok(files.len())
    }

    /// Move open files left by dead producers into the inboxes
    ///
    /// Folders whose owner still holds its lock are skipped. Returns the
    /// number of files recovered.
    pub async fn recover_staging(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(self.staging_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut recovered = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let folder = entry.path();
            let open = folder.join(OPEN_FILE);
            if !tokio::fs::try_exists(&open).await? {
                continue;
            }

            let Some(_owner) = take_ownership(&folder).await? else {
                debug!(folder = %folder.display(), "Staging folder has a live owner");
                continue;
            };

            let target = self.inbox(recovered).join(queue_file_name());
            tokio::fs::rename(&open, &target).await?;
            warn!(from = %open.display(), to = %target.display(), "Recovered open file of a dead producer");
            metrics::try_record_queue_file("recovered");
            recovered += 1;

            tokio::fs::remove_file(folder.join(OWNER_FILE)).await.ok();
            tokio::fs::remove_dir(&folder).await.ok();
        }
        Ok(recovered)
    }
}

/// Take the exclusive lock on a staging folder's owner file
///
/// Returns the locked file, or `None` while another producer holds it. The
/// lock lasts as long as the returned file stays open.
pub(crate) async fn take_ownership(folder: &Path) -> Result<Option<std::fs::File>> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(folder.join(OWNER_FILE))
        .await?
        .into_std()
        .await;

    match file.try_lock() {
        Ok(()) => Ok(Some(file)),
        Err(TryLockError::WouldBlock) => Ok(None),
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

/// Fresh name for a closed queue file
pub(crate) fn queue_file_name() -> String {
    format!("events-{}{}", Ulid::new(), CLOSED_SUFFIX)
}

/// Files in `dir` whose name ends with `suffix`, oldest name first
///
/// `*.log` does not match `*.log.claimed`. A missing directory is empty.
pub(crate) async fn list_files(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(suffix));
        if matches && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
