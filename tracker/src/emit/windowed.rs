//! Windowed concurrent sender
//!
//! Turns a batch into a FIFO of requests (one per event for GET, one per
//! `batch_size` events for POST) and keeps `min(window, remaining)` of them
//! in flight. Each completion admits the next queued request; `send` returns
//! once the FIFO is drained and every in-flight request has finished.
//!
//! ```text
//!  FIFO: [r5 r6 r7 ...]      in flight (window = 4)
//!           │                ┌────┬────┬────┬────┐
//!           └── admit ──────►│ r1 │ r2 │ r3 │ r4 │──► completion recorded
//!               on completion└────┴────┴────┴────┘
//! ```
//!
//! There is no ordering guarantee inside the window; results are recorded
//! in completion order. A failed request never cancels the others.

use crate::config::{EmitterConfig, RequestMethod};
use crate::constants::{
    SYNC_TIMEOUT_SECS, WINDOWED_AMOUNT_GET, WINDOWED_AMOUNT_POST, WINDOWED_BATCH_GET,
    WINDOWED_BATCH_POST, WINDOWED_WINDOW_GET, WINDOWED_WINDOW_POST,
};
use crate::debug::{DebugLog, RequestResult};
use crate::emit::request::{CollectorRequest, HttpTransport};
use crate::emit::{Emitter, SendOutcome, Tally};
use crate::error::{EmitError, TrackerError};
use crate::metrics;
use crate::payload::Payload;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id, JoinSet};
use tracing::{debug, warn};

/// Bounded-concurrency HTTP emitter
pub struct WindowedEmitter {
    transport: Arc<HttpTransport>,
    method: RequestMethod,
    batch_size: usize,
    window: usize,
    buffer_size: usize,
}

impl WindowedEmitter {
    /// Create a windowed emitter
    ///
    /// Defaults for POST: 50 events per request, window of 10, buffer of
    /// 50 requests' worth of events. GET always sends one event per request
    /// with a window of 30 and a buffer of 250 events.
    pub fn new(config: &EmitterConfig) -> Result<Self, TrackerError> {
        config.validate()?;
        let timeout = config
            .timeout
            .unwrap_or(Duration::from_secs(SYNC_TIMEOUT_SECS));

        let (batch_size, window, amount) = match config.method {
            RequestMethod::Get => (
                WINDOWED_BATCH_GET,
                config.window.unwrap_or(WINDOWED_WINDOW_GET),
                WINDOWED_AMOUNT_GET,
            ),
            RequestMethod::Post => (
                config.batch_size.unwrap_or(WINDOWED_BATCH_POST),
                config.window.unwrap_or(WINDOWED_WINDOW_POST),
                WINDOWED_AMOUNT_POST,
            ),
        };

        Ok(Self {
            transport: Arc::new(HttpTransport::new(config.url(), timeout)?),
            method: config.method,
            batch_size,
            window,
            buffer_size: config.buffer_size.unwrap_or(batch_size * amount),
        })
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    pub fn method(&self) -> RequestMethod {
        self.method
    }

    /// Events per request
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Maximum requests in flight
    pub fn window(&self) -> usize {
        self.window
    }

    fn admit(
        &self,
        in_flight: &mut JoinSet<Result<u16, EmitError>>,
        requests: &mut HashMap<Id, Arc<CollectorRequest>>,
        request: CollectorRequest,
    ) {
        let request = Arc::new(request);
        let transport = Arc::clone(&self.transport);
        let task_request = Arc::clone(&request);
        let handle = in_flight.spawn(async move { transport.execute(&task_request).await });
        requests.insert(handle.id(), request);
    }
}

#[async_trait]
impl Emitter for WindowedEmitter {
    fn name(&self) -> &'static str {
        "windowed"
    }

    fn buffer_capacity(&self) -> usize {
        self.buffer_size
    }

    async fn send(&self, batch: &[Payload], debug_log: &DebugLog) -> SendOutcome {
        if batch.is_empty() {
            return SendOutcome::NothingToSend;
        }

        let mut pending = CollectorRequest::split(self.method, batch, self.batch_size);
        let total = pending.len();
        let mut in_flight = JoinSet::new();
        let mut requests = HashMap::with_capacity(self.window.min(total));
        let mut tally = Tally::new();

        while in_flight.len() < self.window {
            match pending.pop_front() {
                Some(request) => self.admit(&mut in_flight, &mut requests, request),
                None => break,
            }
        }

        while let Some(joined) = in_flight.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(join_err) => (
                    join_err.id(),
                    Err(EmitError::Io(format!("request task failed: {join_err}"))),
                ),
            };

            if let Some(request) = requests.remove(&id) {
                let count = request.event_count();
                match result {
                    Ok(code) => {
                        debug_log.push(RequestResult {
                            code,
                            data: request.debug_json(),
                        });
                        metrics::try_record_request(self.name(), true, count);
                        tally.success(count);
                    }
                    Err(e) => {
                        debug!(url = %self.url(), count, error = %e, "Windowed request failed");
                        debug_log.push(RequestResult {
                            code: e.code(),
                            data: request.debug_json(),
                        });
                        metrics::try_record_request(self.name(), false, count);
                        tally.failure(
                            format!("Windowed {} request failed: {}", self.method, e),
                            request.events().to_vec(),
                        );
                    }
                }
            }

            if let Some(next) = pending.pop_front() {
                self.admit(&mut in_flight, &mut requests, next);
            }
        }

        if tally.failed_requests() > 0 {
            warn!(
                url = %self.url(),
                failed = tally.failed_requests(),
                total,
                "Windowed send finished with failures"
            );
        } else {
            debug!(url = %self.url(), requests = total, events = batch.len(), "Windowed send delivered");
        }

        tally.finish()
    }
}
