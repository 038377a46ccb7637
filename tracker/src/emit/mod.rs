//! Delivery strategies
//!
//! An [`Emitter`] accepts a batch of payloads and returns a [`SendOutcome`].
//! The [`crate::EventSink`] owns the buffer and decides when to call it.
//!
//! | Emitter | Delivery |
//! |---------|----------|
//! | [`SyncEmitter`] | one request at a time, awaited in order |
//! | [`WindowedEmitter`] | up to `window` requests in flight |
//! | [`SocketEmitter`] | raw HTTP/1.1 over one kept-alive TCP connection |
//! | [`FileEmitter`] | appends to a durable queue drained by a [`WorkerPool`] |
//!
//! # Example
//!
//! ```ignore
//! struct CountingEmitter(AtomicUsize);
//!
//! #[async_trait]
//! impl Emitter for CountingEmitter {
//!     fn name(&self) -> &'static str { "counting" }
//!
//!     fn buffer_capacity(&self) -> usize { 10 }
//!
//!     async fn send(&self, batch: &[Payload], debug: &DebugLog) -> SendOutcome {
//!         self.0.fetch_add(batch.len(), Ordering::Relaxed);
//!         debug.record(200, batch);
//!         SendOutcome::delivered(batch.len(), 1)
//!     }
//! }
//! ```

pub mod file;
pub mod request;
pub mod socket;
pub mod sync;
pub mod windowed;

use crate::debug::DebugLog;
use crate::error::TrackerError;
use crate::payload::Payload;
use async_trait::async_trait;
use std::fmt;

pub use file::{FileEmitter, QueueLayout, Worker, WorkerExit, WorkerPool, WorkerState};
pub use socket::{SocketEmitter, SocketStatus};
pub use sync::SyncEmitter;
pub use windowed::WindowedEmitter;

/// Emitter trait - delivers batches of payloads to a collector
#[async_trait]
pub trait Emitter: Send + Sync {
    /// Emitter name for identification and logging
    fn name(&self) -> &'static str;

    /// Events an [`crate::EventSink`] buffers before flushing to this emitter
    fn buffer_capacity(&self) -> usize;

    /// Deliver one batch
    ///
    /// Every completed request must be reported through `debug`. Transport
    /// failures are returned as [`SendOutcome::Failed`], never raised.
    async fn send(&self, batch: &[Payload], debug: &DebugLog) -> SendOutcome;

    /// Release connections and persist anything still open
    async fn shutdown(&self) -> Result<(), TrackerError> {
        Ok(())
    }
}

/// Result of one [`Emitter::send`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every request succeeded
    Delivered { events: usize, requests: usize },
    /// The batch was empty
    NothingToSend,
    /// At least one request failed
    ///
    /// `undelivered` holds the payloads of the failed requests only.
    Failed {
        error: String,
        undelivered: Vec<Payload>,
    },
}

impl SendOutcome {
    pub fn delivered(events: usize, requests: usize) -> Self {
        SendOutcome::Delivered { events, requests }
    }

    /// A failure covering the whole batch
    pub fn failed(error: impl Into<String>, batch: &[Payload]) -> Self {
        SendOutcome::Failed {
            error: error.into(),
            undelivered: batch.to_vec(),
        }
    }

    /// True unless some request failed
    pub fn is_success(&self) -> bool {
        !matches!(self, SendOutcome::Failed { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            SendOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn undelivered(&self) -> &[Payload] {
        match self {
            SendOutcome::Failed { undelivered, .. } => undelivered,
            _ => &[],
        }
    }
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendOutcome::Delivered { events, requests } => {
                write!(f, "delivered {events} events in {requests} requests")
            }
            SendOutcome::NothingToSend => f.write_str("No events to send"),
            SendOutcome::Failed { error, .. } => f.write_str(error),
        }
    }
}

/// Accumulates per-request results into one [`SendOutcome`]
#[derive(Debug, Default)]
pub(crate) struct Tally {
    delivered: usize,
    requests: usize,
    errors: Vec<String>,
    undelivered: Vec<Payload>,
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(&mut self, events: usize) {
        self.requests += 1;
        self.delivered += events;
    }

    pub fn failure(&mut self, error: String, events: impl IntoIterator<Item = Payload>) {
        self.requests += 1;
        self.errors.push(error);
        self.undelivered.extend(events);
    }

    pub fn failed_requests(&self) -> usize {
        self.errors.len()
    }

    pub fn finish(self) -> SendOutcome {
        if self.errors.is_empty() {
            if self.requests == 0 {
                SendOutcome::NothingToSend
            } else {
                SendOutcome::delivered(self.delivered, self.requests)
            }
        } else {
            SendOutcome::Failed {
                error: self.errors.join("; "),
                undelivered: self.undelivered,
            }
        }
    }
}
