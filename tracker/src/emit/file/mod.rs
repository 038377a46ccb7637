//! Durable file queue
//!
//! [`FileEmitter`] persists batches instead of sending them; a
//! [`WorkerPool`] drains the queue in the background. The filesystem is the
//! only state shared between the producer and the workers.
//!
//! Each `send` appends one JSON line (an array of payloads) to the
//! producer's open file in `staging/<producer>/current.open`. Once the file
//! holds `events_per_file` events, or on [`FileEmitter::rotate`] and
//! shutdown, it is renamed into the next worker inbox as
//! `events-<ulid>.log`.
//!
//! The producer locks `staging/<producer>/owner.lock` for its lifetime. A
//! new producer or worker pool first adopts the open files of producers
//! that died without closing them.

mod layout;
mod worker;

pub use layout::QueueLayout;
pub use worker::{delivery_emitter, Worker, WorkerExit, WorkerPool, WorkerState};

use self::layout::{queue_file_name, take_ownership, OPEN_FILE, OWNER_FILE};
use crate::config::{EmitterConfig, QueueConfig};
use crate::constants::WORKER_BUFFER;
use crate::debug::DebugLog;
use crate::emit::{Emitter, SendOutcome};
use crate::error::{Result, TrackerError};
use crate::metrics;
use crate::payload::Payload;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Producer side of the open file
struct ProducerState {
    file: Option<File>,
    events: usize,
    next_inbox: usize,
}

/// Emitter that writes batches to the durable queue
pub struct FileEmitter {
    layout: QueueLayout,
    queue: QueueConfig,
    emitter_config: EmitterConfig,
    working_dir: PathBuf,
    buffer_size: usize,
    state: Mutex<ProducerState>,
    /// Holds the staging folder lock until the emitter is dropped
    _owner: std::fs::File,
}

impl FileEmitter {
    /// Create the queue layout and a private staging folder
    ///
    /// The emitter config is validated here so a bad collector host fails
    /// at construction rather than inside a worker.
    pub async fn new(emitter_config: &EmitterConfig, queue: QueueConfig) -> Result<Self> {
        emitter_config.validate()?;
        queue.validate()?;

        let layout = QueueLayout::new(&queue.root, queue.worker_count);
        layout.ensure().await?;
        layout.recover_staging().await?;

        let working_dir = layout.staging_dir().join(Ulid::new().to_string());
        tokio::fs::create_dir_all(&working_dir).await?;
        let owner = take_ownership(&working_dir).await?.ok_or_else(|| {
            TrackerError::Config(format!(
                "staging folder {} is already owned",
                working_dir.display()
            ))
        })?;

        debug!(dir = %working_dir.display(), "File emitter staging folder created");

        Ok(Self {
            layout,
            buffer_size: emitter_config.buffer_size.unwrap_or(WORKER_BUFFER),
            emitter_config: emitter_config.clone(),
            queue,
            working_dir,
            state: Mutex::new(ProducerState {
                file: None,
                events: 0,
                next_inbox: 0,
            }),
            _owner: owner,
        })
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    /// Staging folder holding this producer's open file
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Events written to the open file so far
    pub async fn open_events(&self) -> usize {
        self.state.lock().await.events
    }

    /// Spawn workers draining this emitter's queue
    pub async fn spawn_workers(&self) -> Result<WorkerPool> {
        WorkerPool::spawn(&self.emitter_config, &self.queue).await
    }

    /// Close the open file now, if it holds anything
    ///
    /// Returns the path of the closed file in its worker inbox.
    pub async fn rotate(&self) -> Result<Option<PathBuf>> {
        let mut state = self.state.lock().await;
        self.close(&mut state).await
    }

    async fn append(&self, batch: &[Payload]) -> Result<Option<PathBuf>> {
        let line = serde_json::to_string(batch)?;
        let mut state = self.state.lock().await;

        if state.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.working_dir.join(OPEN_FILE))
                .await?;
            state.file = Some(file);
        }

        if let Some(file) = state.file.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
        }
        state.events += batch.len();

        if state.events >= self.queue.events_per_file {
            return self.close(&mut state).await;
        }
        Ok(None)
    }

    async fn close(&self, state: &mut ProducerState) -> Result<Option<PathBuf>> {
        let Some(file) = state.file.take() else {
            return Ok(None);
        };
        file.sync_all().await?;
        drop(file);

        let target = self.layout.inbox(state.next_inbox).join(queue_file_name());
        tokio::fs::rename(self.working_dir.join(OPEN_FILE), &target).await?;

        debug!(file = %target.display(), events = state.events, "Queue file closed");
        metrics::try_record_queue_file("closed");

        state.next_inbox = (state.next_inbox + 1) % self.layout.worker_count();
        state.events = 0;
        Ok(Some(target))
    }
}

#[async_trait]
impl Emitter for FileEmitter {
    fn name(&self) -> &'static str {
        "file"
    }

    fn buffer_capacity(&self) -> usize {
        self.buffer_size
    }

    async fn send(&self, batch: &[Payload], _debug: &DebugLog) -> SendOutcome {
        if batch.is_empty() {
            return SendOutcome::NothingToSend;
        }

        match self.append(batch).await {
            Ok(_) => SendOutcome::delivered(batch.len(), 1),
            Err(e) => {
                warn!(dir = %self.working_dir.display(), error = %e, "Queue write failed");
                SendOutcome::failed(format!("File queue write failed: {e}"), batch)
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.rotate().await?;
        tokio::fs::remove_file(self.working_dir.join(OWNER_FILE)).await.ok();
        if let Err(e) = tokio::fs::remove_dir(&self.working_dir).await {
            debug!(dir = %self.working_dir.display(), error = %e, "Staging folder left in place");
        }
        info!(root = %self.layout.root().display(), "File emitter shut down");
        Ok(())
    }
}
