//! Debug capture of request outcomes
//!
//! While debug is on, every completed delivery request appends one
//! [`RequestResult`] holding the status code and the serialized data that was
//! sent. Results live in memory and are optionally mirrored to a log file.
//! Capture is observational only: a failure to mirror is logged and ignored.
//!
//! The mirror file is opened once, when debug is enabled, and each result
//! is one line-buffered write on that handle.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::warn;

/// Outcome of one delivery request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestResult {
    /// HTTP status, or `0` when no response was received
    pub code: u16,
    /// JSON of the data carried by the request
    pub data: String,
}

impl RequestResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Open mirror file
struct Mirror {
    path: PathBuf,
    writer: LineWriter<File>,
}

/// In-memory (and optionally on-disk) list of request results
pub struct DebugLog {
    enabled: AtomicBool,
    results: Mutex<Vec<RequestResult>>,
    log_dir: Option<PathBuf>,
    mirror: Mutex<Option<Mirror>>,
    total_recorded: AtomicU64,
}

impl DebugLog {
    /// Create a log; `log_dir` enables mirroring results to a file there
    pub fn new(enabled: bool, log_dir: Option<PathBuf>) -> Self {
        let log = Self {
            enabled: AtomicBool::new(false),
            results: Mutex::new(Vec::new()),
            log_dir,
            mirror: Mutex::new(None),
            total_recorded: AtomicU64::new(0),
        };
        if enabled {
            log.enable();
        }
        log
    }

    /// A log that records nothing until enabled
    pub fn disabled() -> Self {
        Self::new(false, None)
    }

    pub fn enable(&self) {
        if let Some(dir) = &self.log_dir {
            let mut mirror = self.mirror.lock();
            if mirror.is_none() {
                let path = dir.join(format!("debug-{}.log", ulid::Ulid::new()));
                match open_mirror(&path) {
                    Ok(writer) => *mirror = Some(Mirror { path, writer }),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to open debug log, not mirroring");
                    }
                }
            }
        }
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Stop capturing; `delete_local` also drops results and the mirror file
    pub fn disable(&self, delete_local: bool) {
        self.enabled.store(false, Ordering::SeqCst);

        if delete_local {
            self.results.lock().clear();
            if let Some(Mirror { path, writer }) = self.mirror.lock().take() {
                drop(writer);
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %e, "Failed to delete debug log");
                    }
                }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Record a request outcome if debug is on
    pub fn record<T: Serialize + ?Sized>(&self, code: u16, data: &T) {
        if !self.is_enabled() {
            return;
        }
        let data = serde_json::to_string(data).unwrap_or_default();
        self.push(RequestResult { code, data });
    }

    /// Record an already serialized result if debug is on
    pub fn push(&self, result: RequestResult) {
        if !self.is_enabled() {
            return;
        }

        if let Some(mirror) = self.mirror.lock().as_mut() {
            let written = serde_json::to_string(&result)
                .map_err(std::io::Error::from)
                .and_then(|line| writeln!(mirror.writer, "{line}"));
            if let Err(e) = written {
                warn!(path = %mirror.path.display(), error = %e, "Failed to mirror debug result");
            }
        }

        self.results.lock().push(result);
        self.total_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the captured results, in arrival order
    pub fn results(&self) -> Vec<RequestResult> {
        self.results.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }

    /// Total results ever recorded, including cleared ones
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded.load(Ordering::Relaxed)
    }

    /// Path of the mirror file, if mirroring is configured and debug was enabled
    pub fn debug_file(&self) -> Option<PathBuf> {
        self.mirror.lock().as_ref().map(|m| m.path.clone())
    }
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::disabled()
    }
}

fn open_mirror(path: &Path) -> std::io::Result<LineWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LineWriter::new(file))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::payload::Payload;

    #[test]
    fn test_disabled_log_records_nothing() {
        let log = DebugLog::disabled();
        log.record(200, &Payload::new().with("e", "pv"));
        assert!(log.is_empty());
        assert_eq!(log.total_recorded(), 0);
    }

    #[test]
    fn test_records_in_arrival_order() {
        let log = DebugLog::new(true, None);
        log.record(200, &Payload::new().with("n", 1));
        log.record(0, &Payload::new().with("n", 2));

        let results = log.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].code, 200);
        assert_eq!(results[0].data, r#"{"n":1}"#);
        assert!(!results[1].is_success());
    }

    #[test]
    fn test_disable_without_delete_keeps_results() {
        let log = DebugLog::new(true, None);
        log.record(200, "x");
        log.disable(false);
        log.record(200, "y");

        assert!(!log.is_enabled());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_disable_with_delete_clears_results_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = DebugLog::new(true, Some(dir.path().to_path_buf()));
        log.record(200, "first");
        log.record(503, "second");

        let path = log.debug_file().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);

        log.disable(true);
        assert!(log.is_empty());
        assert!(!path.exists());
        assert!(log.debug_file().is_none());
        assert_eq!(log.total_recorded(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_mirror_survives_removed_dir_entry() {
        let dir = tempfile::tempdir().unwrap();
        let log = DebugLog::new(true, Some(dir.path().join("nested")));
        let path = log.debug_file().unwrap();
        assert!(path.exists());

        // Writes go to the handle opened at enable time, not to a fresh open
        std::fs::remove_file(&path).unwrap();
        log.record(200, "after unlink");
        assert!(!path.exists());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_re_enable_keeps_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = DebugLog::new(true, Some(dir.path().to_path_buf()));
        log.record(200, "a");
        let first = log.debug_file().unwrap();

        log.disable(false);
        log.enable();
        log.record(200, "b");

        assert_eq!(log.debug_file().unwrap(), first);
        assert_eq!(std::fs::read_to_string(&first).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_no_mirror_file_without_dir() {
        let log = DebugLog::new(true, None);
        log.record(200, "x");
        assert!(log.debug_file().is_none());
    }
}
