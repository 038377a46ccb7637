//! Configuration for emitters, the file queue and the drain binary

use crate::constants::{
    GET_PATH, POST_PATH, WORKER_COUNT, WORKER_EVENTS_PER_FILE, WORKER_FOLDER,
    WORKER_MAX_EMPTY_POLLS, WORKER_POLL_INTERVAL_SECS,
};
use crate::error::{Result, TrackerError};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Collector URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    /// Parse a scheme name, case-insensitively
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(TrackerError::Config(format!(
                "invalid protocol: {other} (expected 'http' or 'https')"
            ))),
        }
    }
}

/// HTTP verb used to deliver events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMethod {
    Get,
    #[default]
    Post,
}

impl RequestMethod {
    /// Parse a verb; anything other than `GET` resolves to `POST`
    pub fn parse_lossy(value: &str) -> Self {
        if value.eq_ignore_ascii_case("GET") {
            RequestMethod::Get
        } else {
            RequestMethod::Post
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Get => "GET",
            RequestMethod::Post => "POST",
        }
    }

    /// Collector path for this verb
    pub fn path(&self) -> &'static str {
        match self {
            RequestMethod::Get => GET_PATH,
            RequestMethod::Post => POST_PATH,
        }
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the collector URL for a scheme, host and verb
pub fn collector_url(protocol: Protocol, host: &str, method: RequestMethod) -> String {
    format!("{}://{}{}", protocol.as_str(), host, method.path())
}

/// Emitter configuration
///
/// Optional fields fall back to the defaults of whichever emitter consumes
/// the config; see [`crate::constants`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitterConfig {
    /// Collector host, optionally with port (`collector.acme.au:8080`)
    pub host: String,
    pub protocol: Protocol,
    pub method: RequestMethod,
    /// Events buffered before an automatic flush
    pub buffer_size: Option<usize>,
    /// Events per POST request for windowed delivery
    pub batch_size: Option<usize>,
    /// Maximum concurrent requests for windowed delivery
    pub window: Option<usize>,
    /// Request, connect and read timeout
    pub timeout: Option<Duration>,
    pub debug: bool,
    /// Directory that mirrors debug request results to a log file
    pub debug_log_dir: Option<PathBuf>,
}

impl EmitterConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            protocol: Protocol::default(),
            method: RequestMethod::default(),
            buffer_size: None,
            batch_size: None,
            window: None,
            timeout: None,
            debug: false,
            debug_log_dir: None,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_method(mut self, method: RequestMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_debug_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.debug_log_dir = Some(dir.into());
        self
    }

    /// Collector URL for the configured scheme, host and verb
    pub fn url(&self) -> String {
        collector_url(self.protocol, &self.host, self.method)
    }

    /// Reject configurations no emitter can work with
    pub fn validate(&self) -> Result<()> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(TrackerError::Config("collector host is required".into()));
        }
        if host.contains("://") || host.contains('/') {
            return Err(TrackerError::Config(format!(
                "collector host must not include a scheme or path: {host}"
            )));
        }
        if self.buffer_size == Some(0) {
            return Err(TrackerError::Config("buffer size must be at least 1".into()));
        }
        if self.batch_size == Some(0) {
            return Err(TrackerError::Config("batch size must be at least 1".into()));
        }
        if self.window == Some(0) {
            return Err(TrackerError::Config("window must be at least 1".into()));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(TrackerError::Config("timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Sender used by queue workers to deliver claimed files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    Sync,
    #[default]
    Windowed,
}

/// Durable file queue configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Root holding worker inboxes, `failed/` and `staging/`
    pub root: PathBuf,
    pub worker_count: usize,
    /// Events written before a queue file is closed
    pub events_per_file: usize,
    /// Wait between empty inbox scans
    pub poll_interval: Duration,
    /// Consecutive empty scans before a worker terminates
    pub max_empty_polls: u32,
    pub delivery: DeliveryMode,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(WORKER_FOLDER),
            worker_count: WORKER_COUNT,
            events_per_file: WORKER_EVENTS_PER_FILE,
            poll_interval: Duration::from_secs(WORKER_POLL_INTERVAL_SECS),
            max_empty_polls: WORKER_MAX_EMPTY_POLLS,
            delivery: DeliveryMode::default(),
        }
    }
}

impl QueueConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(TrackerError::Config("worker count must be at least 1".into()));
        }
        if self.events_per_file == 0 {
            return Err(TrackerError::Config(
                "events per file must be at least 1".into(),
            ));
        }
        if self.max_empty_polls == 0 {
            return Err(TrackerError::Config(
                "max empty polls must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Configuration for the `tracker-drain` binary
#[derive(Debug, Clone)]
pub struct Config {
    pub emitter: EmitterConfig,
    pub queue: QueueConfig,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from `TRACKER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("TRACKER_COLLECTOR_HOST").ok_or_else(|| {
            TrackerError::Config("TRACKER_COLLECTOR_HOST is required".to_string())
        })?;
        let mut emitter = EmitterConfig::new(host);

        if let Some(protocol) = lookup("TRACKER_PROTOCOL") {
            emitter.protocol = Protocol::parse(&protocol)?;
        }

        if let Some(method) = lookup("TRACKER_METHOD") {
            emitter.method = RequestMethod::parse_lossy(&method);
        }

        if let Some(size) = lookup("TRACKER_BUFFER_SIZE") {
            emitter.buffer_size = Some(parse_var("TRACKER_BUFFER_SIZE", &size)?);
        }

        if let Some(size) = lookup("TRACKER_BATCH_SIZE") {
            emitter.batch_size = Some(parse_var("TRACKER_BATCH_SIZE", &size)?);
        }

        if let Some(window) = lookup("TRACKER_WINDOW") {
            emitter.window = Some(parse_var("TRACKER_WINDOW", &window)?);
        }

        if let Some(secs) = lookup("TRACKER_TIMEOUT_SECS") {
            emitter.timeout = Some(Duration::from_secs(parse_var(
                "TRACKER_TIMEOUT_SECS",
                &secs,
            )?));
        }

        if let Some(debug) = lookup("TRACKER_DEBUG") {
            emitter.debug = parse_bool("TRACKER_DEBUG", &debug)?;
        }

        if let Some(dir) = lookup("TRACKER_DEBUG_LOG_DIR") {
            emitter.debug_log_dir = Some(PathBuf::from(dir));
        }

        emitter.validate()?;

        let mut queue = QueueConfig::default();

        if let Some(root) = lookup("TRACKER_QUEUE_DIR") {
            queue.root = PathBuf::from(root);
        }

        if let Some(count) = lookup("TRACKER_WORKER_COUNT") {
            queue.worker_count = parse_var("TRACKER_WORKER_COUNT", &count)?;
        }

        if let Some(count) = lookup("TRACKER_EVENTS_PER_FILE") {
            queue.events_per_file = parse_var("TRACKER_EVENTS_PER_FILE", &count)?;
        }

        if let Some(secs) = lookup("TRACKER_POLL_INTERVAL_SECS") {
            queue.poll_interval =
                Duration::from_secs(parse_var("TRACKER_POLL_INTERVAL_SECS", &secs)?);
        }

        if let Some(mode) = lookup("TRACKER_WORKER_DELIVERY") {
            queue.delivery = match mode.to_lowercase().as_str() {
                "sync" => DeliveryMode::Sync,
                "windowed" => DeliveryMode::Windowed,
                other => {
                    return Err(TrackerError::Config(format!(
                        "invalid TRACKER_WORKER_DELIVERY: {other} (expected 'sync' or 'windowed')"
                    )))
                }
            };
        }

        queue.validate()?;

        let log_level = lookup("TRACKER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let log_format = match lookup("TRACKER_LOG_FORMAT") {
            None => LogFormat::Pretty,
            Some(format) => match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(TrackerError::Config(format!(
                        "invalid TRACKER_LOG_FORMAT: {other} (expected 'json' or 'pretty')"
                    )))
                }
            },
        };

        Ok(Config {
            emitter,
            queue,
            log_level,
            log_format,
        })
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| TrackerError::Config(format!("invalid {name}: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(TrackerError::Config(format!("invalid {name}: {other}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_unknown_method_falls_back_to_post() {
        assert_eq!(RequestMethod::parse_lossy("POSTS"), RequestMethod::Post);
        assert_eq!(RequestMethod::parse_lossy("get"), RequestMethod::Get);
        assert_eq!(RequestMethod::parse_lossy(""), RequestMethod::Post);
    }

    #[test]
    fn test_collector_url() {
        assert_eq!(
            collector_url(Protocol::Http, "localhost:4545", RequestMethod::Get),
            "http://localhost:4545/i"
        );
        assert_eq!(
            collector_url(Protocol::Https, "collector.acme.au", RequestMethod::Post),
            "https://collector.acme.au/com.snowplowanalytics.snowplow/tp2"
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(EmitterConfig::new("").validate().is_err());
        assert!(EmitterConfig::new("http://acme.au").validate().is_err());
        assert!(EmitterConfig::new("acme.au")
            .with_buffer_size(0)
            .validate()
            .is_err());
        assert!(EmitterConfig::new("acme.au").with_window(0).validate().is_err());
        assert!(EmitterConfig::new("acme.au").validate().is_ok());
    }

    #[test]
    fn test_default_queue_config() {
        let queue = QueueConfig::default();
        assert_eq!(queue.worker_count, 2);
        assert_eq!(queue.events_per_file, 250);
        assert_eq!(queue.poll_interval, Duration::from_secs(15));
        assert_eq!(queue.max_empty_polls, 5);
    }

    #[test]
    fn test_config_requires_host() {
        let result = Config::from_lookup(lookup_from(&[]));
        assert!(matches!(result, Err(TrackerError::Config(_))));
    }

    #[test]
    fn test_config_from_lookup() {
        let config = Config::from_lookup(lookup_from(&[
            ("TRACKER_COLLECTOR_HOST", "collector.acme.au"),
            ("TRACKER_METHOD", "get"),
            ("TRACKER_BUFFER_SIZE", "10"),
            ("TRACKER_DEBUG", "true"),
            ("TRACKER_QUEUE_DIR", "/var/spool/tracker"),
            ("TRACKER_WORKER_DELIVERY", "sync"),
            ("TRACKER_LOG_FORMAT", "json"),
        ]))
        .unwrap();

        assert_eq!(config.emitter.method, RequestMethod::Get);
        assert_eq!(config.emitter.buffer_size, Some(10));
        assert!(config.emitter.debug);
        assert_eq!(config.queue.root, PathBuf::from("/var/spool/tracker"));
        assert_eq!(config.queue.delivery, DeliveryMode::Sync);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_config_rejects_invalid_numbers() {
        let result = Config::from_lookup(lookup_from(&[
            ("TRACKER_COLLECTOR_HOST", "collector.acme.au"),
            ("TRACKER_WINDOW", "ten"),
        ]));
        assert!(matches!(result, Err(TrackerError::Config(_))));
    }
}
