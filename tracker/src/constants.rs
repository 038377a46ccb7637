//! Protocol constants and emitter defaults

/// Schema wrapping every POST body
pub const POST_REQ_SCHEMA: &str = "iglu:com.snowplowanalytics.snowplow/payload_data/jsonschema/1-0-4";

pub const POST_PATH: &str = "/com.snowplowanalytics.snowplow/tp2";
pub const GET_PATH: &str = "/i";
pub const POST_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const POST_ACCEPT: &str = "application/json";

/// Platform reported when the subject does not override it
pub const DEFAULT_PLATFORM: &str = "srv";

/// Send-time timestamp field injected at flush
pub const SENT_TIMESTAMP_KEY: &str = "stm";

// Immediate sender
pub const SYNC_BUFFER: usize = 50;
pub const SYNC_TIMEOUT_SECS: u64 = 30;

// Socket sender
pub const SOCKET_BUFFER: usize = 50;
pub const SOCKET_TIMEOUT_SECS: u64 = 30;
/// Consecutive failed connects before the socket settles in `Disconnected`
pub const SOCKET_MAX_CONNECT_FAILURES: u32 = 3;

// Windowed sender: `BATCH` events per request, `AMOUNT` requests per flush
pub const WINDOWED_BATCH_POST: usize = 50;
pub const WINDOWED_AMOUNT_POST: usize = 50;
pub const WINDOWED_WINDOW_POST: usize = 10;
pub const WINDOWED_BATCH_GET: usize = 1;
pub const WINDOWED_AMOUNT_GET: usize = 250;
pub const WINDOWED_WINDOW_GET: usize = 30;

// File queue and workers
pub const WORKER_COUNT: usize = 2;
pub const WORKER_BUFFER: usize = 250;
pub const WORKER_EVENTS_PER_FILE: usize = 250;
pub const WORKER_POLL_INTERVAL_SECS: u64 = 15;
/// Consecutive empty polls after which a worker terminates
pub const WORKER_MAX_EMPTY_POLLS: u32 = 5;
pub const WORKER_FOLDER: &str = "temp";
pub const WORKER_BATCH_POST: usize = 50;
pub const WORKER_BATCH_GET: usize = 1;
pub const WORKER_WINDOW_POST: usize = 10;
pub const WORKER_WINDOW_GET: usize = 30;
