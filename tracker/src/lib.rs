//! Snowplow tracker emitters
//!
//! Delivers finished tracker payloads to a Snowplow collector. An
//! [`EventSink`] buffers payloads and hands full batches to one of four
//! delivery strategies:
//!
//! ```text
//! add_event ──► EventSink (buffer, subject, debug) ──► Emitter
//!                                                      ├─ SyncEmitter
//!                                                      ├─ WindowedEmitter
//!                                                      ├─ SocketEmitter
//!                                                      └─ FileEmitter ──► queue ──► WorkerPool
//! ```
//!
//! All strategies implement [`Emitter`], so custom ones plug in the same way.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod buffer;
pub mod config;
pub mod constants;
pub mod debug;
pub mod emit;
pub mod error;
pub mod metrics;
pub mod payload;
pub mod sink;
pub mod subject;

pub use buffer::EventBuffer;
pub use config::{
    collector_url, Config, DeliveryMode, EmitterConfig, LogFormat, Protocol, QueueConfig,
    RequestMethod,
};
pub use debug::{DebugLog, RequestResult};
pub use emit::{
    Emitter, FileEmitter, QueueLayout, SendOutcome, SocketEmitter, SocketStatus, SyncEmitter,
    WindowedEmitter, Worker, WorkerExit, WorkerPool, WorkerState,
};
pub use error::{EmitError, Result, TrackerError};
pub use metrics::Metrics;
pub use payload::{Payload, Value};
pub use sink::{EventSink, FlushResult};
pub use subject::Subject;
