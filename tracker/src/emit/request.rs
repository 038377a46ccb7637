//! Collector requests shared by the HTTP-based emitters

use crate::config::RequestMethod;
use crate::constants::{POST_ACCEPT, POST_CONTENT_TYPE, POST_REQ_SCHEMA};
use crate::error::{EmitError, TrackerError};
use crate::payload::Payload;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Body of every POST request
#[derive(Debug, Serialize)]
pub struct PostEnvelope<'a> {
    pub schema: &'static str,
    pub data: &'a [Payload],
}

impl<'a> PostEnvelope<'a> {
    pub fn new(data: &'a [Payload]) -> Self {
        Self {
            schema: POST_REQ_SCHEMA,
            data,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One request to the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorRequest {
    /// A single event as query string
    Get(Payload),
    /// A batch wrapped in a [`PostEnvelope`]
    Post(Vec<Payload>),
}

impl CollectorRequest {
    /// Split a batch into requests
    ///
    /// GET yields one request per event; POST yields one request per
    /// `batch_size` events.
    pub fn split(
        method: RequestMethod,
        batch: &[Payload],
        batch_size: usize,
    ) -> VecDeque<CollectorRequest> {
        match method {
            RequestMethod::Get => batch.iter().cloned().map(CollectorRequest::Get).collect(),
            RequestMethod::Post => batch
                .chunks(batch_size.max(1))
                .map(|chunk| CollectorRequest::Post(chunk.to_vec()))
                .collect(),
        }
    }

    pub fn method(&self) -> RequestMethod {
        match self {
            CollectorRequest::Get(_) => RequestMethod::Get,
            CollectorRequest::Post(_) => RequestMethod::Post,
        }
    }

    pub fn events(&self) -> &[Payload] {
        match self {
            CollectorRequest::Get(payload) => std::slice::from_ref(payload),
            CollectorRequest::Post(events) => events,
        }
    }

    pub fn event_count(&self) -> usize {
        self.events().len()
    }

    /// The data a debug request result stores for this request
    pub fn debug_json(&self) -> String {
        match self {
            CollectorRequest::Get(payload) => serde_json::to_string(payload).unwrap_or_default(),
            CollectorRequest::Post(events) => PostEnvelope::new(events).to_json(),
        }
    }
}

/// reqwest-backed request executor
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    url: String,
}

impl HttpTransport {
    /// Build a client whose connect and request timeouts are `timeout`
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TrackerError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Execute one request, returning the 2xx status on success
    pub async fn execute(&self, request: &CollectorRequest) -> Result<u16, EmitError> {
        let builder = match request {
            CollectorRequest::Get(payload) => self
                .client
                .get(format!("{}?{}", self.url, payload.to_query_string())),
            CollectorRequest::Post(events) => self
                .client
                .post(&self.url)
                .header(CONTENT_TYPE, POST_CONTENT_TYPE)
                .header(ACCEPT, POST_ACCEPT)
                .body(PostEnvelope::new(events).to_json()),
        };

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(EmitError::Status {
                code: status.as_u16(),
            })
        }
    }
}
