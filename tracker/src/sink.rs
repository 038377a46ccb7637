//! Event sink - buffers finished payloads and hands batches to an emitter
//!
//! # Example
//!
//! ```ignore
//! use snowplow_tracker::{EmitterConfig, EventSink, Payload, RequestMethod};
//!
//! let config = EmitterConfig::new("collector.acme.au")
//!     .with_method(RequestMethod::Post)
//!     .with_debug(true);
//! let sink = EventSink::sync(&config)?;
//!
//! sink.add_event(Payload::new().with("e", "pv").with("url", "https://acme.au")).await;
//! sink.flush(true).await;
//! ```
//!
//! The buffer is flushed automatically, and blocking, on the `add_event`
//! that fills it. At most one flush talks to the emitter at a time.

use crate::buffer::EventBuffer;
use crate::config::{EmitterConfig, QueueConfig};
use crate::constants::SENT_TIMESTAMP_KEY;
use crate::debug::{DebugLog, RequestResult};
use crate::emit::{Emitter, FileEmitter, SendOutcome, SocketEmitter, SyncEmitter, WindowedEmitter};
use crate::error::Result;
use crate::metrics;
use crate::payload::Payload;
use crate::subject::Subject;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Result of [`EventSink::flush`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushResult {
    /// The flush ran to completion
    Completed(SendOutcome),
    /// The batch was handed to a background task
    Dispatched,
}

impl FlushResult {
    /// Outcome of a completed flush
    pub fn outcome(&self) -> Option<&SendOutcome> {
        match self {
            FlushResult::Completed(outcome) => Some(outcome),
            FlushResult::Dispatched => None,
        }
    }
}

/// State shared with background flush tasks
struct Dispatcher {
    emitter: Arc<dyn Emitter>,
    debug_log: Arc<DebugLog>,
    /// Held for the duration of one emitter call
    gate: tokio::sync::Mutex<()>,
    flushes: AtomicU64,
}

impl Dispatcher {
    async fn deliver(&self, batch: Vec<Payload>) -> SendOutcome {
        if batch.is_empty() {
            return SendOutcome::NothingToSend;
        }
        metrics::try_add_buffered(-(batch.len() as i64));

        let _guard = self.gate.lock().await;
        self.flushes.fetch_add(1, Ordering::Relaxed);

        let batch = stamp_sent(batch);
        let outcome = self.emitter.send(&batch, &self.debug_log).await;

        match &outcome {
            SendOutcome::Failed { error, undelivered } => warn!(
                emitter = self.emitter.name(),
                failed = undelivered.len(),
                error = %error,
                "Flush failed"
            ),
            other => debug!(emitter = self.emitter.name(), outcome = %other, "Flush complete"),
        }
        outcome
    }
}

/// Set `stm` to the current time in milliseconds on every payload
fn stamp_sent(mut batch: Vec<Payload>) -> Vec<Payload> {
    let stm = Utc::now().timestamp_millis().to_string();
    for payload in &mut batch {
        payload.insert(SENT_TIMESTAMP_KEY, stm.as_str());
    }
    batch
}

/// Buffering engine in front of one [`Emitter`]
pub struct EventSink {
    buffer: EventBuffer,
    subject: Option<Subject>,
    dispatcher: Arc<Dispatcher>,
    pending: Mutex<Vec<JoinHandle<SendOutcome>>>,
}

impl EventSink {
    /// Wrap an emitter; the buffer takes the emitter's capacity
    pub fn new(emitter: Arc<dyn Emitter>, debug_log: DebugLog) -> Self {
        Self {
            buffer: EventBuffer::new(emitter.buffer_capacity()),
            subject: None,
            dispatcher: Arc::new(Dispatcher {
                emitter,
                debug_log: Arc::new(debug_log),
                gate: tokio::sync::Mutex::new(()),
                flushes: AtomicU64::new(0),
            }),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn from_config(emitter: Arc<dyn Emitter>, config: &EmitterConfig) -> Self {
        Self::new(
            emitter,
            DebugLog::new(config.debug, config.debug_log_dir.clone()),
        )
    }

    /// Sink over a [`SyncEmitter`]
    pub fn sync(config: &EmitterConfig) -> Result<Self> {
        Ok(Self::from_config(Arc::new(SyncEmitter::new(config)?), config))
    }

    /// Sink over a [`WindowedEmitter`]
    pub fn windowed(config: &EmitterConfig) -> Result<Self> {
        Ok(Self::from_config(
            Arc::new(WindowedEmitter::new(config)?),
            config,
        ))
    }

    /// Sink over a [`SocketEmitter`]
    pub fn socket(config: &EmitterConfig) -> Result<Self> {
        Ok(Self::from_config(
            Arc::new(SocketEmitter::new(config)?),
            config,
        ))
    }

    /// Sink over a [`FileEmitter`]; spawn its workers separately
    pub async fn file(config: &EmitterConfig, queue: QueueConfig) -> Result<Self> {
        let emitter = FileEmitter::new(config, queue).await?;
        Ok(Self::from_config(Arc::new(emitter), config))
    }

    /// Merge `subject` into every payload added from now on
    pub fn with_subject(mut self, subject: Subject) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn set_subject(&mut self, subject: Option<Subject>) {
        self.subject = subject;
    }

    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    pub fn emitter(&self) -> &Arc<dyn Emitter> {
        &self.dispatcher.emitter
    }

    /// Buffer the payload; flushes (blocking) when the buffer fills
    ///
    /// Returns the outcome of the automatic flush if this call ran one.
    pub async fn add_event(&self, mut payload: Payload) -> Option<SendOutcome> {
        if let Some(subject) = &self.subject {
            subject.merge_into(&mut payload);
        }
        metrics::try_add_buffered(1);

        let batch = self.buffer.push_and_take_if_full(payload)?;
        self.await_pending().await;
        Some(self.dispatcher.deliver(batch).await)
    }

    /// Send everything buffered
    ///
    /// A blocking flush first waits for every earlier non-blocking flush,
    /// then sends and returns the outcome. A non-blocking flush returns as
    /// soon as the batch is handed to a background task.
    pub async fn flush(&self, blocking: bool) -> FlushResult {
        let batch = self.buffer.take_all();

        if blocking {
            self.await_pending().await;
            return FlushResult::Completed(self.dispatcher.deliver(batch).await);
        }

        if batch.is_empty() {
            return FlushResult::Completed(SendOutcome::NothingToSend);
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = tokio::spawn(async move { dispatcher.deliver(batch).await });

        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
        FlushResult::Dispatched
    }

    async fn await_pending(&self) {
        let handles = std::mem::take(&mut *self.pending.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background flush did not complete");
            }
        }
    }

    /// Flush blocking, then release the emitter
    pub async fn shutdown(&self) -> Result<SendOutcome> {
        let outcome = match self.flush(true).await {
            FlushResult::Completed(outcome) => outcome,
            FlushResult::Dispatched => SendOutcome::NothingToSend,
        };
        self.dispatcher.emitter.shutdown().await?;
        Ok(outcome)
    }

    pub fn enable_debug(&self) {
        self.dispatcher.debug_log.enable();
    }

    /// Stop capturing results; `delete_local` also drops captured results
    pub fn disable_debug(&self, delete_local: bool) {
        self.dispatcher.debug_log.disable(delete_local);
    }

    pub fn debug_log(&self) -> &DebugLog {
        &self.dispatcher.debug_log
    }

    /// Captured request results, in arrival order
    pub fn request_results(&self) -> Vec<RequestResult> {
        self.dispatcher.debug_log.results()
    }

    /// Buffer capacity that triggers an automatic flush
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Events waiting for the next flush
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Flushes that reached the emitter with a non-empty batch
    pub fn flush_count(&self) -> u64 {
        self.dispatcher.flushes.load(Ordering::Relaxed)
    }
}
