//! Immediate sender
//!
//! Delivers a batch on the calling task, one request at a time. GET sends
//! one request per event; POST wraps the whole batch in a single envelope.
//! Each `send` is exactly one attempt; nothing is retried here.

use crate::config::{EmitterConfig, RequestMethod};
use crate::constants::{SYNC_BUFFER, SYNC_TIMEOUT_SECS};
use crate::debug::{DebugLog, RequestResult};
use crate::emit::request::{CollectorRequest, HttpTransport};
use crate::emit::{Emitter, SendOutcome, Tally};
use crate::error::TrackerError;
use crate::metrics;
use crate::payload::Payload;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Sequential HTTP emitter
pub struct SyncEmitter {
    transport: HttpTransport,
    method: RequestMethod,
    buffer_size: usize,
    timeout: Duration,
}

impl SyncEmitter {
    /// Create a sync emitter
    ///
    /// Defaults: buffer of 50 events, 30s request timeout.
    ///
    /// # Errors
    /// Returns `TrackerError::Config` for an invalid config and
    /// `TrackerError::Http` if the HTTP client cannot be built.
    pub fn new(config: &EmitterConfig) -> Result<Self, TrackerError> {
        config.validate()?;
        let timeout = config
            .timeout
            .unwrap_or(Duration::from_secs(SYNC_TIMEOUT_SECS));

        Ok(Self {
            transport: HttpTransport::new(config.url(), timeout)?,
            method: config.method,
            buffer_size: config.buffer_size.unwrap_or(SYNC_BUFFER),
            timeout,
        })
    }

    /// Collector URL requests are sent to
    pub fn url(&self) -> &str {
        self.transport.url()
    }

    pub fn method(&self) -> RequestMethod {
        self.method
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Emitter for SyncEmitter {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn buffer_capacity(&self) -> usize {
        self.buffer_size
    }

    async fn send(&self, batch: &[Payload], debug_log: &DebugLog) -> SendOutcome {
        if batch.is_empty() {
            return SendOutcome::NothingToSend;
        }

        let mut tally = Tally::new();

        for request in CollectorRequest::split(self.method, batch, batch.len()) {
            let count = request.event_count();
            match self.transport.execute(&request).await {
                Ok(code) => {
                    debug!(url = %self.url(), count, status = code, "Sync request delivered");
                    debug_log.push(RequestResult {
                        code,
                        data: request.debug_json(),
                    });
                    metrics::try_record_request(self.name(), true, count);
                    tally.success(count);
                }
                Err(e) => {
                    warn!(url = %self.url(), count, error = %e, "Sync request failed");
                    debug_log.push(RequestResult {
                        code: e.code(),
                        data: request.debug_json(),
                    });
                    metrics::try_record_request(self.name(), false, count);
                    tally.failure(
                        format!("Sync {} request failed: {}", self.method, e),
                        request.events().to_vec(),
                    );
                }
            }
        }

        tally.finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use axum::{
        extract::{RawQuery, State},
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::Value as JsonValue;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Shared state for mock collector
    #[derive(Default)]
    struct MockCollector {
        get_queries: Mutex<Vec<String>>,
        post_bodies: Mutex<Vec<JsonValue>>,
        request_count: AtomicUsize,
    }

    async fn start_mock_collector() -> (SocketAddr, Arc<MockCollector>) {
        let state = Arc::new(MockCollector::default());

        let app = Router::new()
            .route("/i", get(handle_get))
            .route("/com.snowplowanalytics.snowplow/tp2", post(handle_post))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        (addr, state)
    }

    async fn handle_get(
        State(state): State<Arc<MockCollector>>,
        RawQuery(query): RawQuery,
    ) -> StatusCode {
        state.request_count.fetch_add(1, Ordering::SeqCst);
        let query = query.unwrap_or_default();
        let status = if query.contains("fail=") {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        };
        state.get_queries.lock().await.push(query);
        status
    }

    async fn handle_post(
        State(state): State<Arc<MockCollector>>,
        Json(body): Json<JsonValue>,
    ) -> StatusCode {
        state.request_count.fetch_add(1, Ordering::SeqCst);
        let failing = body["data"]
            .as_array()
            .is_some_and(|events| events.iter().any(|e| e.get("fail").is_some()));
        state.post_bodies.lock().await.push(body);
        if failing {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    }

    fn make_batch(n: usize) -> Vec<Payload> {
        (0..n)
            .map(|i| Payload::new().with("e", "pv").with("eid", format!("e{i}")))
            .collect()
    }

    fn emitter_for(addr: SocketAddr, method: RequestMethod) -> SyncEmitter {
        let config = EmitterConfig::new(addr.to_string()).with_method(method);
        SyncEmitter::new(&config).unwrap()
    }

    #[test]
    fn test_unknown_method_resolves_to_post_url_and_default_buffer() {
        let config = EmitterConfig::new("localhost:4545")
            .with_method(RequestMethod::parse_lossy("POSTS"));
        let emitter = SyncEmitter::new(&config).unwrap();

        assert_eq!(
            emitter.url(),
            "http://localhost:4545/com.snowplowanalytics.snowplow/tp2"
        );
        assert_eq!(emitter.method(), RequestMethod::Post);
        assert_eq!(emitter.buffer_capacity(), 50);
    }

    #[test]
    fn test_get_url_and_protocol() {
        let config = EmitterConfig::new("collector.acme.au")
            .with_protocol(Protocol::Https)
            .with_method(RequestMethod::Get)
            .with_buffer_size(10);
        let emitter = SyncEmitter::new(&config).unwrap();

        assert_eq!(emitter.url(), "https://collector.acme.au/i");
        assert_eq!(emitter.buffer_capacity(), 10);
        assert_eq!(emitter.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_empty_host_is_fatal() {
        let result = SyncEmitter::new(&EmitterConfig::new(" "));
        assert!(matches!(result, Err(TrackerError::Config(_))));
    }

    #[tokio::test]
    async fn test_empty_batch_is_nothing_to_send() {
        let (addr, state) = start_mock_collector().await;
        let emitter = emitter_for(addr, RequestMethod::Post);

        let outcome = emitter.send(&[], &DebugLog::new(true, None)).await;
        assert_eq!(outcome, SendOutcome::NothingToSend);
        assert_eq!(state.request_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_sends_one_request_per_event() {
        let (addr, state) = start_mock_collector().await;
        let emitter = emitter_for(addr, RequestMethod::Get);
        let debug_log = DebugLog::new(true, None);

        let outcome = emitter.send(&make_batch(4), &debug_log).await;

        assert_eq!(outcome, SendOutcome::delivered(4, 4));
        assert_eq!(state.request_count.load(Ordering::SeqCst), 4);
        let queries = state.get_queries.lock().await;
        assert_eq!(queries[0], "e=pv&eid=e0");
        assert_eq!(queries[3], "e=pv&eid=e3");

        let results = debug_log.results();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.code == 200));
    }

    #[tokio::test]
    async fn test_post_sends_single_envelope() {
        let (addr, state) = start_mock_collector().await;
        let emitter = emitter_for(addr, RequestMethod::Post);
        let debug_log = DebugLog::new(true, None);

        let outcome = emitter.send(&make_batch(7), &debug_log).await;

        assert_eq!(outcome, SendOutcome::delivered(7, 1));
        assert_eq!(state.request_count.load(Ordering::SeqCst), 1);

        let bodies = state.post_bodies.lock().await;
        assert_eq!(
            bodies[0]["schema"],
            "iglu:com.snowplowanalytics.snowplow/payload_data/jsonschema/1-0-4"
        );
        assert_eq!(bodies[0]["data"].as_array().unwrap().len(), 7);
        assert_eq!(debug_log.len(), 1);
    }

    #[tokio::test]
    async fn test_post_to_unreachable_host_records_failure() {
        let config = EmitterConfig::new("127.0.0.1:1")
            .with_method(RequestMethod::Post)
            .with_timeout(Duration::from_secs(2));
        let emitter = SyncEmitter::new(&config).unwrap();
        let debug_log = DebugLog::new(true, None);

        let outcome = emitter.send(&make_batch(1), &debug_log).await;

        assert!(!outcome.is_success());
        assert!(outcome.error().unwrap().starts_with("Sync POST request failed"));
        assert_eq!(outcome.undelivered().len(), 1);

        let results = debug_log.results();
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_success());
    }

    #[tokio::test]
    async fn test_get_concatenates_item_errors() {
        let config = EmitterConfig::new("127.0.0.1:1")
            .with_method(RequestMethod::Get)
            .with_timeout(Duration::from_secs(2));
        let emitter = SyncEmitter::new(&config).unwrap();

        let outcome = emitter.send(&make_batch(2), &DebugLog::disabled()).await;

        let error = outcome.error().unwrap();
        assert_eq!(error.matches("Sync GET request failed").count(), 2);
        assert_eq!(outcome.undelivered().len(), 2);
    }

    #[tokio::test]
    async fn test_post_500_is_failure_with_status() {
        let (addr, state) = start_mock_collector().await;
        let emitter = emitter_for(addr, RequestMethod::Post);
        let debug_log = DebugLog::new(true, None);
        let mut batch = make_batch(2);
        batch[1].insert("fail", "yes");

        let outcome = emitter.send(&batch, &debug_log).await;

        assert!(!outcome.is_success());
        assert_eq!(
            outcome.error().unwrap(),
            "Sync POST request failed: collector returned 500"
        );
        assert_eq!(outcome.undelivered(), batch.as_slice());
        assert_eq!(state.request_count.load(Ordering::SeqCst), 1);

        let results = debug_log.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].code, 500);
    }

    #[tokio::test]
    async fn test_get_mixed_statuses_fail_only_rejected_events() {
        let (addr, _state) = start_mock_collector().await;
        let emitter = emitter_for(addr, RequestMethod::Get);
        let debug_log = DebugLog::new(true, None);
        let mut batch = make_batch(3);
        batch[1].insert("fail", "yes");

        let outcome = emitter.send(&batch, &debug_log).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.undelivered(), &batch[1..2]);
        let codes: Vec<u16> = debug_log.results().iter().map(|r| r.code).collect();
        assert_eq!(codes, vec![200, 500, 200]);
    }
}
