use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_THREAD_COUNT: usize = 4;
pub const DEFAULT_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_URI: &str = "http://localhost:5000/json";
pub const DEFAULT_MEASURED_THREADS: usize = 32;
pub const DEFAULT_METRICS_CAPACITY: usize = 300_000;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BUFFER_CAPACITY: usize = 65_536;

/// Smallest response buffer the boundary detector can work with: it must hold the
/// status line prefix and leave room to refill after keeping a partial marker.
pub const MIN_BUFFER_CAPACITY: usize = 32;

/// Interval between two process samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// How long past the configured duration the orchestrator keeps waiting for workers.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Error types for load generation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Read timed out")]
    ReadTimeout,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Response ended before a Content-Length header was found")]
    MissingContentLength,

    #[error("Response ended before the header terminator was found")]
    MissingHeaderTerminator,

    #[error("Invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Failed to spawn worker: {0}")]
    WorkerSpawn(String),
}

impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => LoadError::ReadTimeout,
            io::ErrorKind::UnexpectedEof => LoadError::ConnectionClosed,
            _ => LoadError::ConnectionError(err.to_string()),
        }
    }
}

/// Result type for load generation
pub type Result<T> = std::result::Result<T, LoadError>;

/// Where the load goes: host and port to connect to, path to request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl TargetAddr {
    /// `host:port`, suitable for `ToSocketAddrs`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}:{}{}", self.host, self.port, self.path)
    }
}

impl Default for TargetAddr {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5000,
            path: "/json".to_string(),
        }
    }
}

/// The fixed request written once per iteration: `GET <path> HTTP/1.1\r\n\r\n`.
///
/// No `Host` header and no connection-close semantics; the response side relies on
/// the same minimal framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTemplate {
    bytes: Vec<u8>,
}

impl RequestTemplate {
    pub fn new(path: &str) -> Self {
        let path = if path.is_empty() { "/" } else { path };
        Self {
            bytes: format!("GET {path} HTTP/1.1\r\n\r\n").into_bytes(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Immutable run configuration consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub thread_count: usize,
    pub duration: Duration,
    pub target: TargetAddr,
    /// Requested number of measured workers; see [`RunConfig::measured_threads`].
    pub measured_threads: usize,
    /// Initial capacity of each measured slot's sample sequences.
    pub metrics_capacity: usize,
    pub read_timeout: Duration,
    pub buffer_capacity: usize,
}

impl RunConfig {
    /// Number of measured workers, clamped to the thread count.
    pub fn measured_threads(&self) -> usize {
        self.measured_threads.min(self.thread_count)
    }

    /// Response buffer size, raised to [`MIN_BUFFER_CAPACITY`] when configured smaller.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity.max(MIN_BUFFER_CAPACITY)
    }

    pub fn request(&self) -> RequestTemplate {
        RequestTemplate::new(&self.target.path)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,
            duration: DEFAULT_DURATION,
            target: TargetAddr::default(),
            measured_threads: DEFAULT_MEASURED_THREADS,
            metrics_capacity: DEFAULT_METRICS_CAPACITY,
            read_timeout: DEFAULT_READ_TIMEOUT,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}
