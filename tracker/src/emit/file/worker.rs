//! Queue workers
//!
//! A worker owns one inbox. It claims closed files by renaming them to
//! `*.log.claimed`, delivers every batch line through an HTTP emitter and
//! then deletes the claim or moves it to quarantine. Each file gets exactly
//! one delivery attempt.
//!
//! A claim left behind by a crash is reprocessed on the next start, so it
//! must only ever hold undelivered events. A partly failed claim is
//! rewritten before it moves, and a delivered claim that cannot be deleted
//! is emptied.
//!
//! ```text
//! Idle → Scanning ─┬─ file ──► Claiming → Sending ─┬─ ok ───► Deleting ─────► Idle
//!                  │                               └─ fail ─► Quarantining ─► Idle
//!                  ├─ empty (< max) ──► Waiting ──► Scanning
//!                  └─ empty (≥ max) ──► Terminated
//! ```

use super::layout::{list_files, queue_file_name, QueueLayout, CLAIMED_SUFFIX, CLOSED_SUFFIX};
use crate::config::{DeliveryMode, EmitterConfig, QueueConfig, RequestMethod};
use crate::constants::{WORKER_BATCH_GET, WORKER_BATCH_POST, WORKER_WINDOW_GET, WORKER_WINDOW_POST};
use crate::debug::DebugLog;
use crate::emit::{Emitter, SyncEmitter, WindowedEmitter};
use crate::error::{Result, TrackerError};
use crate::metrics;
use crate::payload::Payload;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Where a worker is in its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Scanning,
    Claiming,
    Sending,
    Deleting,
    Quarantining,
    Waiting,
    Terminated,
}

/// Terminal signal returned when a worker stops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker: usize,
    /// Files whose every event was delivered
    pub files_delivered: u64,
    /// Files moved, whole or in part, to quarantine
    pub files_quarantined: u64,
    /// Consecutive empty polls at exit
    pub empty_polls: u32,
}

/// What happened to one claimed file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileResult {
    Delivered,
    Quarantined,
}

/// Drains one inbox
pub struct Worker {
    id: usize,
    inbox: PathBuf,
    layout: QueueLayout,
    emitter: Arc<dyn Emitter>,
    debug_log: Arc<DebugLog>,
    poll_interval: Duration,
    max_empty_polls: u32,
    state: WorkerState,
    files_delivered: u64,
    files_quarantined: u64,
}

impl Worker {
    pub fn new(
        id: usize,
        layout: QueueLayout,
        emitter: Arc<dyn Emitter>,
        debug_log: Arc<DebugLog>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            id,
            inbox: layout.inbox(id),
            layout,
            emitter,
            debug_log,
            poll_interval: config.poll_interval,
            max_empty_polls: config.max_empty_polls.max(1),
            state: WorkerState::Idle,
            files_delivered: 0,
            files_quarantined: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run until the inbox stays empty for `max_empty_polls` scans
    pub async fn run(mut self) -> WorkerExit {
        info!(worker = self.id, inbox = %self.inbox.display(), "Worker started");

        match self.reclaim().await {
            Ok(0) => {}
            Ok(count) => info!(worker = self.id, count, "Reclaimed files left by a previous run"),
            Err(e) => error!(worker = self.id, error = %e, "Failed to reclaim claimed files"),
        }

        let mut empty_polls = 0u32;
        loop {
            match self.poll_once().await {
                Ok(0) => empty_polls += 1,
                Ok(_) => empty_polls = 0,
                Err(e) => {
                    error!(worker = self.id, error = %e, "Inbox scan failed");
                    empty_polls += 1;
                }
            }

            if empty_polls >= self.max_empty_polls {
                break;
            }
            if empty_polls > 0 {
                self.state = WorkerState::Waiting;
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        self.state = WorkerState::Terminated;
        info!(
            worker = self.id,
            delivered = self.files_delivered,
            quarantined = self.files_quarantined,
            "Worker terminated after empty polls"
        );

        WorkerExit {
            worker: self.id,
            files_delivered: self.files_delivered,
            files_quarantined: self.files_quarantined,
            empty_polls,
        }
    }

    /// Process claims a crashed run left in this worker's inbox
    pub async fn reclaim(&mut self) -> Result<usize> {
        let claimed = list_files(&self.inbox, CLAIMED_SUFFIX).await?;
        for path in &claimed {
            self.process(path).await;
        }
        self.state = WorkerState::Idle;
        Ok(claimed.len())
    }

    /// Scan the inbox once and process every file this worker could claim
    ///
    /// Returns the number of files processed; `0` is an empty poll.
    pub async fn poll_once(&mut self) -> Result<usize> {
        self.state = WorkerState::Scanning;
        let files = list_files(&self.inbox, CLOSED_SUFFIX).await?;

        let mut processed = 0;
        for path in files {
            self.state = WorkerState::Claiming;
            let Some(claimed) = claim(&path).await else {
                continue;
            };
            self.process(&claimed).await;
            processed += 1;
        }

        self.state = WorkerState::Idle;
        Ok(processed)
    }

    async fn process(&mut self, claimed: &Path) {
        let result = match self.deliver(claimed).await {
            Ok(result) => result,
            Err(e) => {
                error!(worker = self.id, file = %claimed.display(), error = %e, "Queue file handling failed");
                return;
            }
        };

        match result {
            FileResult::Delivered => {
                self.files_delivered += 1;
                metrics::try_record_queue_file("delivered");
            }
            FileResult::Quarantined => {
                self.files_quarantined += 1;
                metrics::try_record_queue_file("quarantined");
            }
        }
    }

    async fn deliver(&mut self, claimed: &Path) -> Result<FileResult> {
        let batches = match read_batches(claimed).await {
            Ok(batches) => batches,
            Err(e) => {
                warn!(worker = self.id, file = %claimed.display(), error = %e, "Unreadable queue file quarantined");
                self.state = WorkerState::Quarantining;
                self.quarantine_whole(claimed).await?;
                return Ok(FileResult::Quarantined);
            }
        };

        self.state = WorkerState::Sending;
        let total: usize = batches.iter().map(Vec::len).sum();
        let mut undelivered = Vec::new();
        let mut errors = Vec::new();

        for batch in &batches {
            let outcome = self.emitter.send(batch, &self.debug_log).await;
            if let Some(error) = outcome.error() {
                errors.push(error.to_string());
            }
            undelivered.extend_from_slice(outcome.undelivered());
        }

        if undelivered.is_empty() {
            self.state = WorkerState::Deleting;
            self.retire(claimed).await?;
            debug!(worker = self.id, events = total, "Queue file delivered");
            return Ok(FileResult::Delivered);
        }

        self.state = WorkerState::Quarantining;
        warn!(
            worker = self.id,
            failed = undelivered.len(),
            total,
            error = %errors.join("; "),
            "Queue file delivery failed, quarantining"
        );

        if undelivered.len() < total {
            // The claim must never again hold delivered events
            rewrite(claimed, &undelivered).await?;
        }
        self.quarantine_whole(claimed).await?;
        Ok(FileResult::Quarantined)
    }

    /// Remove a claim whose events are all accounted for
    ///
    /// When the inbox refuses the delete the claim is emptied instead, so a
    /// later reclaim has nothing to resend.
    async fn retire(&self, claimed: &Path) -> Result<()> {
        if let Err(e) = tokio::fs::remove_file(claimed).await {
            warn!(worker = self.id, file = %claimed.display(), error = %e, "Delivered claim not deleted, emptying it");
            tokio::fs::write(claimed, "").await?;
        }
        Ok(())
    }

    async fn quarantine_whole(&self, claimed: &Path) -> Result<()> {
        let name = claimed
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(CLAIMED_SUFFIX))
            .map(|stem| format!("{stem}{CLOSED_SUFFIX}"))
            .unwrap_or_else(queue_file_name);
        let failed_dir = self.layout.failed_dir();
        tokio::fs::create_dir_all(&failed_dir).await?;
        let target = failed_dir.join(name);

        if let Err(e) = tokio::fs::rename(claimed, &target).await {
            warn!(worker = self.id, file = %claimed.display(), error = %e, "Claim not moved, copying into quarantine");
            tokio::fs::copy(claimed, &target).await?;
            self.retire(claimed).await?;
        }
        Ok(())
    }
}

/// Replace a claim's contents with `events`, atomically where the inbox allows
async fn rewrite(claimed: &Path, events: &[Payload]) -> Result<()> {
    let contents = format!("{}\n", serde_json::to_string(events)?);
    let mut tmp = claimed.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let atomic = match tokio::fs::write(&tmp, &contents).await {
        Ok(()) => tokio::fs::rename(&tmp, claimed).await,
        Err(e) => Err(e),
    };
    if let Err(e) = atomic {
        debug!(file = %claimed.display(), error = %e, "Atomic rewrite refused, overwriting in place");
        tokio::fs::remove_file(&tmp).await.ok();
        tokio::fs::write(claimed, &contents).await?;
    }
    Ok(())
}

/// Claim a closed file; `None` when another worker got there first
async fn claim(path: &Path) -> Option<PathBuf> {
    let mut claimed = path.as_os_str().to_owned();
    claimed.push(".claimed");
    let claimed = PathBuf::from(claimed);

    match tokio::fs::rename(path, &claimed).await {
        Ok(()) => Some(claimed),
        Err(e) => {
            debug!(file = %path.display(), error = %e, "Queue file already claimed");
            None
        }
    }
}

/// One JSON array of payloads per non-empty line
async fn read_batches(path: &Path) -> Result<Vec<Vec<Payload>>> {
    let contents = tokio::fs::read_to_string(path).await?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| TrackerError::Serialization(format!("bad queue line: {e}")))
        })
        .collect()
}

/// Emitter a worker delivers through
///
/// POST workers send sub-batches of 50 with a window of 10, GET workers
/// single events with a window of 30, unless the config overrides them.
pub fn delivery_emitter(
    config: &EmitterConfig,
    mode: DeliveryMode,
) -> Result<Arc<dyn Emitter>> {
    let emitter: Arc<dyn Emitter> = match mode {
        DeliveryMode::Sync => Arc::new(SyncEmitter::new(config)?),
        DeliveryMode::Windowed => {
            let (batch, window) = match config.method {
                RequestMethod::Get => (WORKER_BATCH_GET, WORKER_WINDOW_GET),
                RequestMethod::Post => (WORKER_BATCH_POST, WORKER_WINDOW_POST),
            };
            let mut config = config.clone();
            config.batch_size = config.batch_size.or(Some(batch));
            config.window = config.window.or(Some(window));
            Arc::new(WindowedEmitter::new(&config)?)
        }
    };
    Ok(emitter)
}

/// A set of workers draining one queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<WorkerExit>>,
    debug_log: Arc<DebugLog>,
}

impl WorkerPool {
    /// Create the queue layout, adopt orphaned staging files and spawn
    /// `queue.worker_count` workers
    pub async fn spawn(emitter_config: &EmitterConfig, queue: &QueueConfig) -> Result<Self> {
        queue.validate()?;
        let layout = QueueLayout::new(&queue.root, queue.worker_count);
        layout.ensure().await?;
        let recovered = layout.recover_staging().await?;
        if recovered > 0 {
            info!(files = recovered, "Adopted open files of dead producers");
        }

        let emitter = delivery_emitter(emitter_config, queue.delivery)?;
        let debug_log = Arc::new(DebugLog::new(
            emitter_config.debug,
            emitter_config.debug_log_dir.clone(),
        ));

        let handles = (0..queue.worker_count)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    layout.clone(),
                    Arc::clone(&emitter),
                    Arc::clone(&debug_log),
                    queue,
                );
                tokio::spawn(worker.run())
            })
            .collect::<Vec<_>>();

        info!(
            workers = handles.len(),
            root = %layout.root().display(),
            emitter = emitter.name(),
            "Worker pool spawned"
        );

        Ok(Self { handles, debug_log })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Request results recorded by every worker of the pool
    pub fn debug_log(&self) -> &Arc<DebugLog> {
        &self.debug_log
    }

    /// Handles that stop the workers while [`WorkerPool::join`] owns the pool
    pub fn abort_handles(&self) -> Vec<AbortHandle> {
        self.handles.iter().map(JoinHandle::abort_handle).collect()
    }

    /// Wait for every worker to terminate
    ///
    /// Workers that panicked or were aborted are logged and left out.
    pub async fn join(self) -> Vec<WorkerExit> {
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(exit) => Some(exit),
                Err(e) => {
                    error!(error = %e, "Worker task did not finish");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::emit::SendOutcome;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Records batches; fails every event whose `fail` key is set
    #[derive(Default)]
    struct ScriptedEmitter {
        batches: Mutex<Vec<Vec<Payload>>>,
    }

    #[async_trait]
    impl Emitter for ScriptedEmitter {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn buffer_capacity(&self) -> usize {
            10
        }

        async fn send(&self, batch: &[Payload], debug: &DebugLog) -> SendOutcome {
            self.batches.lock().push(batch.to_vec());
            let failed: Vec<Payload> = batch
                .iter()
                .filter(|p| p.contains_key("fail"))
                .cloned()
                .collect();
            debug.record(if failed.is_empty() { 200 } else { 500 }, batch);
            if failed.is_empty() {
                SendOutcome::delivered(batch.len(), 1)
            } else {
                SendOutcome::Failed {
                    error: "scripted failure".into(),
                    undelivered: failed,
                }
            }
        }
    }

    fn queue_config(root: &Path) -> QueueConfig {
        QueueConfig {
            poll_interval: Duration::from_millis(10),
            max_empty_polls: 2,
            ..QueueConfig::new(root)
        }
    }

    async fn setup(workers: usize) -> (TempDir, QueueLayout, QueueConfig) {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig {
            worker_count: workers,
            ..queue_config(dir.path())
        };
        let layout = QueueLayout::new(dir.path(), workers);
        layout.ensure().await.unwrap();
        (dir, layout, config)
    }

    fn line(events: &[Payload]) -> String {
        format!("{}\n", serde_json::to_string(events).unwrap())
    }

    fn event(n: i64) -> Payload {
        Payload::new().with("e", "pv").with("n", n)
    }

    fn worker(id: usize, layout: &QueueLayout, emitter: &Arc<ScriptedEmitter>, config: &QueueConfig) -> Worker {
        Worker::new(
            id,
            layout.clone(),
            Arc::clone(emitter) as Arc<dyn Emitter>,
            Arc::new(DebugLog::new(true, None)),
            config,
        )
    }

    #[tokio::test]
    async fn test_delivered_file_is_deleted() {
        let (_dir, layout, config) = setup(1).await;
        let file = layout.inbox(0).join("events-a.log");
        let contents = format!("{}{}", line(&[event(1), event(2)]), line(&[event(3)]));
        tokio::fs::write(&file, contents).await.unwrap();

        let emitter = Arc::new(ScriptedEmitter::default());
        let mut worker = worker(0, &layout, &emitter, &config);

        assert_eq!(worker.poll_once().await.unwrap(), 1);
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(!file.exists());
        assert!(layout.pending_files().await.unwrap().is_empty());
        assert!(layout.quarantined_files().await.unwrap().is_empty());

        let batches = emitter.batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }

    #[tokio::test]
    async fn test_failed_file_moves_to_quarantine() {
        let (_dir, layout, config) = setup(1).await;
        let file = layout.inbox(0).join("events-b.log");
        tokio::fs::write(&file, line(&[event(1).with("fail", true)]))
            .await
            .unwrap();

        let emitter = Arc::new(ScriptedEmitter::default());
        let mut worker = worker(0, &layout, &emitter, &config);
        worker.poll_once().await.unwrap();

        let quarantined = layout.quarantined_files().await.unwrap();
        assert_eq!(quarantined, vec![layout.failed_dir().join("events-b.log")]);

        // Not retried on the next scan
        assert_eq!(worker.poll_once().await.unwrap(), 0);
        assert_eq!(emitter.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_quarantines_only_failed_events() {
        let (_dir, layout, config) = setup(1).await;
        let file = layout.inbox(0).join("events-c.log");
        let events = vec![event(1), event(2).with("fail", true), event(3)];
        tokio::fs::write(&file, line(&events)).await.unwrap();

        let emitter = Arc::new(ScriptedEmitter::default());
        let mut worker = worker(0, &layout, &emitter, &config);
        worker.poll_once().await.unwrap();

        let quarantined = layout.quarantined_files().await.unwrap();
        assert_eq!(quarantined.len(), 1);
        let contents = tokio::fs::read_to_string(&quarantined[0]).await.unwrap();
        let batch: Vec<Payload> = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(batch, vec![event(2).with("fail", true)]);
        assert!(!layout.inbox(0).join("events-c.log.claimed").exists());
    }

    #[tokio::test]
    async fn test_unreadable_file_quarantined_untouched() {
        let (_dir, layout, config) = setup(1).await;
        let file = layout.inbox(0).join("events-d.log");
        tokio::fs::write(&file, "not json\n").await.unwrap();

        let emitter = Arc::new(ScriptedEmitter::default());
        let mut worker = worker(0, &layout, &emitter, &config);
        worker.poll_once().await.unwrap();

        let quarantined = layout.failed_dir().join("events-d.log");
        assert_eq!(tokio::fs::read_to_string(quarantined).await.unwrap(), "not json\n");
        assert!(emitter.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("events-e.log");
        tokio::fs::write(&file, "[]\n").await.unwrap();

        let first = claim(&file).await;
        let second = claim(&file).await;
        assert_eq!(first, Some(dir.path().join("events-e.log.claimed")));
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_run_reclaims_then_terminates_after_empty_polls() {
        let (_dir, layout, config) = setup(1).await;
        let leftover = layout.inbox(0).join("events-f.log.claimed");
        tokio::fs::write(&leftover, line(&[event(1)])).await.unwrap();

        let emitter = Arc::new(ScriptedEmitter::default());
        let exit = worker(0, &layout, &emitter, &config).run().await;

        assert_eq!(
            exit,
            WorkerExit {
                worker: 0,
                files_delivered: 1,
                files_quarantined: 0,
                empty_polls: 2,
            }
        );
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn test_worker_ignores_other_inboxes() {
        let (_dir, layout, config) = setup(2).await;
        tokio::fs::write(layout.inbox(1).join("events-g.log"), line(&[event(1)]))
            .await
            .unwrap();

        let emitter = Arc::new(ScriptedEmitter::default());
        let mut worker = worker(0, &layout, &emitter, &config);
        assert_eq!(worker.poll_once().await.unwrap(), 0);
        assert_eq!(layout.pending_files().await.unwrap().len(), 1);
    }

    #[cfg(unix)]
    fn set_read_only(dir: &Path, read_only: bool) {
        use std::os::unix::fs::PermissionsExt;
        let mode = if read_only { 0o555 } else { 0o755 };
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_undeletable_claim_is_not_resent() {
        let (_dir, layout, config) = setup(1).await;
        let claimed = layout.inbox(0).join("events-h.log.claimed");
        tokio::fs::write(&claimed, line(&[event(1), event(2)])).await.unwrap();
        set_read_only(&layout.inbox(0), true);

        let emitter = Arc::new(ScriptedEmitter::default());
        let mut first = worker(0, &layout, &emitter, &config);
        first.reclaim().await.unwrap();

        // A restart reclaims whatever is left
        let mut second = worker(0, &layout, &emitter, &config);
        second.reclaim().await.unwrap();
        set_read_only(&layout.inbox(0), false);

        let sent: usize = emitter.batches.lock().iter().map(Vec::len).sum();
        assert_eq!(sent, 2);
        if claimed.exists() {
            assert!(std::fs::read_to_string(&claimed).unwrap().is_empty());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stuck_partial_claim_keeps_only_failed_events() {
        let (_dir, layout, config) = setup(1).await;
        let claimed = layout.inbox(0).join("events-i.log.claimed");
        let events = vec![event(1), event(2).with("fail", true), event(3)];
        tokio::fs::write(&claimed, line(&events)).await.unwrap();
        set_read_only(&layout.inbox(0), true);

        let emitter = Arc::new(ScriptedEmitter::default());
        worker(0, &layout, &emitter, &config).reclaim().await.unwrap();
        worker(0, &layout, &emitter, &config).reclaim().await.unwrap();
        set_read_only(&layout.inbox(0), false);

        // Delivered events went out once; the failed one sits in quarantine
        let sent = emitter.batches.lock().clone();
        assert_eq!(sent[0], events);
        assert!(sent[1..].iter().flatten().all(|p| p.contains_key("fail")));

        let quarantined = layout.quarantined_files().await.unwrap();
        assert_eq!(quarantined, vec![layout.failed_dir().join("events-i.log")]);
        let contents = tokio::fs::read_to_string(&quarantined[0]).await.unwrap();
        let batch: Vec<Payload> = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(batch, vec![event(2).with("fail", true)]);
    }

    #[tokio::test]
    async fn test_empty_claim_is_cleared() {
        let (_dir, layout, config) = setup(1).await;
        let claimed = layout.inbox(0).join("events-j.log.claimed");
        tokio::fs::write(&claimed, "").await.unwrap();

        let emitter = Arc::new(ScriptedEmitter::default());
        assert_eq!(worker(0, &layout, &emitter, &config).reclaim().await.unwrap(), 1);

        assert!(!claimed.exists());
        assert!(emitter.batches.lock().is_empty());
    }

    #[test]
    fn test_delivery_emitter_defaults() {
        let config = EmitterConfig::new("localhost:4545");
        let emitter = delivery_emitter(&config, DeliveryMode::Windowed).unwrap();
        assert_eq!(emitter.name(), "windowed");

        let emitter = delivery_emitter(&config, DeliveryMode::Sync).unwrap();
        assert_eq!(emitter.name(), "sync");

        let bad = EmitterConfig::new("");
        assert!(delivery_emitter(&bad, DeliveryMode::Sync).is_err());
    }
}
