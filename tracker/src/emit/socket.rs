//! Persistent socket sender
//!
//! Keeps one TCP connection to the collector open across calls and writes
//! raw HTTP/1.1 itself. Requests on a connection are strictly sequential.
//!
//! # Connection states
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!      ▲               ▲              │ I/O error
//!      │               └── next send ─┤
//!      │                              ▼
//!      └──── 3 failed connects ──── Failed
//! ```
//!
//! A failed connection is never retried inside the same `send`; the next
//! call reconnects. A collector that answers `Connection: close` is not a
//! failure: the following request simply opens a new connection. Plain TCP only: `https` is rejected at construction.

use crate::config::{EmitterConfig, Protocol, RequestMethod};
use crate::constants::{
    GET_PATH, POST_ACCEPT, POST_CONTENT_TYPE, POST_PATH, SOCKET_BUFFER,
    SOCKET_MAX_CONNECT_FAILURES, SOCKET_TIMEOUT_SECS,
};
use crate::debug::{DebugLog, RequestResult};
use crate::emit::request::{CollectorRequest, PostEnvelope};
use crate::emit::{Emitter, SendOutcome, Tally};
use crate::error::{EmitError, TrackerError};
use crate::metrics;
use crate::payload::Payload;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Connection state of a [`SocketEmitter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

struct Connection {
    status: SocketStatus,
    stream: Option<BufReader<TcpStream>>,
    connect_failures: u32,
}

impl Connection {
    fn mark_failed(&mut self) {
        self.stream = None;
        self.status = SocketStatus::Failed;
    }
}

/// Parsed collector response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Response {
    code: u16,
    keep_alive: bool,
}

/// Raw-HTTP emitter over a long-lived TCP connection
pub struct SocketEmitter {
    host: String,
    addr: String,
    method: RequestMethod,
    buffer_size: usize,
    timeout: Duration,
    conn: Mutex<Connection>,
}

impl SocketEmitter {
    /// Create a socket emitter; no connection is opened until the first send
    ///
    /// Defaults: buffer of 50 events, 30s connect/read timeout.
    pub fn new(config: &EmitterConfig) -> Result<Self, TrackerError> {
        config.validate()?;
        if config.protocol == Protocol::Https {
            return Err(TrackerError::Config(
                "socket emitter does not support https".to_string(),
            ));
        }

        Ok(Self {
            host: config.host.clone(),
            addr: socket_addr(&config.host),
            method: config.method,
            buffer_size: config.buffer_size.unwrap_or(SOCKET_BUFFER),
            timeout: config
                .timeout
                .unwrap_or(Duration::from_secs(SOCKET_TIMEOUT_SECS)),
            conn: Mutex::new(Connection {
                status: SocketStatus::Disconnected,
                stream: None,
                connect_failures: 0,
            }),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn method(&self) -> RequestMethod {
        self.method
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn status(&self) -> SocketStatus {
        self.conn.lock().await.status
    }

    /// Consecutive failed connection attempts since the last success
    pub async fn connect_failures(&self) -> u32 {
        self.conn.lock().await.connect_failures
    }

    async fn connect(&self, conn: &mut Connection) -> Result<(), EmitError> {
        conn.status = SocketStatus::Connecting;

        let result = match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(EmitError::Connection(format!(
                "failed to connect to {}: {}",
                self.addr, e
            ))),
            Err(_) => Err(EmitError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        };

        match result {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                conn.stream = Some(BufReader::new(stream));
                conn.status = SocketStatus::Connected;
                conn.connect_failures = 0;
                info!(addr = %self.addr, "Socket connected");
                Ok(())
            }
            Err(e) => {
                conn.stream = None;
                conn.connect_failures += 1;
                if conn.connect_failures >= SOCKET_MAX_CONNECT_FAILURES {
                    warn!(
                        addr = %self.addr,
                        attempts = conn.connect_failures,
                        "Socket giving up until next send"
                    );
                    conn.connect_failures = 0;
                    conn.status = SocketStatus::Disconnected;
                } else {
                    conn.status = SocketStatus::Failed;
                }
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        stream: &mut BufReader<TcpStream>,
        request: &CollectorRequest,
    ) -> Result<Response, EmitError> {
        let raw = encode_request(&self.host, request);
        let io = async {
            stream
                .get_mut()
                .write_all(raw.as_bytes())
                .await
                .map_err(|e| EmitError::Io(e.to_string()))?;
            stream
                .get_mut()
                .flush()
                .await
                .map_err(|e| EmitError::Io(e.to_string()))?;
            read_response(stream).await
        };

        match tokio::time::timeout(self.timeout, io).await {
            Ok(result) => result,
            Err(_) => Err(EmitError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }

    /// One request on the shared connection, reconnecting first if needed
    ///
    /// A collector that closes gracefully leaves the connection
    /// `Disconnected`, so the next request opens a fresh one. Only a write
    /// or read failure marks it `Failed`.
    async fn request(
        &self,
        conn: &mut Connection,
        request: &CollectorRequest,
    ) -> Result<u16, EmitError> {
        if conn.stream.is_none() {
            if let Err(e) = self.connect(conn).await {
                warn!(addr = %self.addr, error = %e, "Socket connect failed");
                return Err(e);
            }
        }
        let Some(stream) = conn.stream.as_mut() else {
            return Err(EmitError::Io("not connected".into()));
        };

        match self.exchange(stream, request).await {
            Ok(response) => {
                if !response.keep_alive {
                    debug!(addr = %self.addr, "Collector closed the connection");
                    conn.stream = None;
                    conn.status = SocketStatus::Disconnected;
                }
                if (200..300).contains(&response.code) {
                    Ok(response.code)
                } else {
                    Err(EmitError::Status {
                        code: response.code,
                    })
                }
            }
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "Socket I/O failed, connection marked failed");
                conn.mark_failed();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Emitter for SocketEmitter {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn buffer_capacity(&self) -> usize {
        self.buffer_size
    }

    async fn send(&self, batch: &[Payload], debug_log: &DebugLog) -> SendOutcome {
        if batch.is_empty() {
            return SendOutcome::NothingToSend;
        }

        let requests = CollectorRequest::split(self.method, batch, batch.len());
        let mut conn = self.conn.lock().await;
        let mut tally = Tally::new();
        // Set by a connect or I/O failure; the rest of this send fails with it
        let mut broken: Option<EmitError> = None;

        for request in requests {
            let count = request.event_count();
            let result = match &broken {
                Some(e) => Err(e.clone()),
                None => self.request(&mut conn, &request).await,
            };

            match result {
                Ok(code) => {
                    debug!(addr = %self.addr, count, status = code, "Socket request delivered");
                    debug_log.push(RequestResult {
                        code,
                        data: request.debug_json(),
                    });
                    metrics::try_record_request(self.name(), true, count);
                    tally.success(count);
                }
                Err(e) => {
                    if !matches!(e, EmitError::Status { .. }) {
                        broken = Some(e.clone());
                    }
                    debug_log.push(RequestResult {
                        code: e.code(),
                        data: request.debug_json(),
                    });
                    metrics::try_record_request(self.name(), false, count);
                    tally.failure(
                        format!("Socket {} request failed: {}", self.method, e),
                        request.events().to_vec(),
                    );
                }
            }
        }

        tally.finish()
    }

    async fn shutdown(&self) -> Result<(), TrackerError> {
        let mut conn = self.conn.lock().await;
        if let Some(mut stream) = conn.stream.take() {
            stream.get_mut().shutdown().await.ok();
        }
        conn.status = SocketStatus::Disconnected;
        Ok(())
    }
}

/// `host[:port]` with the HTTP port filled in when absent
fn socket_addr(host: &str) -> String {
    let has_port = match host.rsplit_once(':') {
        Some((name, port)) => {
            !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit())
                && (!name.contains(':') || name.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        host.to_string()
    } else {
        format!("{host}:80")
    }
}

/// Serialize a request as raw HTTP/1.1
fn encode_request(host: &str, request: &CollectorRequest) -> String {
    match request {
        CollectorRequest::Get(payload) => format!(
            "GET {}?{} HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\nConnection: keep-alive\r\n\r\n",
            GET_PATH,
            payload.to_query_string(),
            host
        ),
        CollectorRequest::Post(events) => {
            let body = PostEnvelope::new(events).to_json();
            format!(
                "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: {}\r\nAccept: {}\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
                POST_PATH,
                host,
                POST_CONTENT_TYPE,
                POST_ACCEPT,
                body.len(),
                body
            )
        }
    }
}

/// Parse `HTTP/1.1 200 OK` into its status code
fn parse_status_line(line: &str) -> Result<u16, EmitError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| EmitError::Protocol(format!("bad status code in {:?}", line.trim_end()))),
        _ => Err(EmitError::Protocol(format!(
            "bad status line {:?}",
            line.trim_end()
        ))),
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, EmitError> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| EmitError::Io(e.to_string()))?;
    if n == 0 {
        return Err(EmitError::Io("connection closed by collector".into()));
    }
    Ok(line)
}

/// Read one response, consuming its body so the connection can be reused
async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Response, EmitError> {
    let code = parse_status_line(&read_line(reader).await?)?;

    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut keep_alive = true;

    loop {
        let line = read_line(reader).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => {
                    content_length = Some(value.parse().map_err(|_| {
                        EmitError::Protocol(format!("bad content-length {value:?}"))
                    })?);
                }
                "transfer-encoding" => {
                    chunked = value.to_ascii_lowercase().contains("chunked");
                }
                "connection" => {
                    keep_alive = !value.eq_ignore_ascii_case("close");
                }
                _ => {}
            }
        }
    }

    let io_err = |e: std::io::Error| EmitError::Io(e.to_string());

    if chunked {
        loop {
            let size_line = read_line(reader).await?;
            let size_hex = size_line.trim().split(';').next().unwrap_or("");
            let size = u64::from_str_radix(size_hex, 16)
                .map_err(|_| EmitError::Protocol(format!("bad chunk size {size_hex:?}")))?;
            if size == 0 {
                while !read_line(reader).await?.trim_end().is_empty() {}
                break;
            }
            tokio::io::copy(&mut (&mut *reader).take(size + 2), &mut tokio::io::sink())
                .await
                .map_err(io_err)?;
        }
    } else if let Some(len) = content_length {
        let copied = tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink())
            .await
            .map_err(io_err)?;
        if copied < len {
            return Err(EmitError::Io("response body truncated".into()));
        }
    } else if !(code < 200 || code == 204 || code == 304) {
        // No framing: the body runs until the collector closes
        tokio::io::copy(reader, &mut tokio::io::sink())
            .await
            .map_err(io_err)?;
        keep_alive = false;
    }

    Ok(Response { code, keep_alive })
}
