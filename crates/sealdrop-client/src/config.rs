//! Client configuration
//!
//! All tunables are fixed at construction time; managers take the config by
//! value and never mutate it. In particular the encryption chunk size is an
//! explicit field here rather than a process-wide value initialized after the
//! fact, so a transfer's chunk geometry cannot change mid-stream.

use sealdrop_crypto::{DEFAULT_CHUNK_SIZE, STREAM_OVERHEAD};
use std::time::Duration;

/// Default upper bound for the in-memory delivery sink (500 MB)
pub const DEFAULT_MEMORY_SINK_MAX: u64 = 500 * 1024 * 1024;

/// Retry behavior for transport operations
///
/// Applied uniformly to upload continuation sends and download ranged reads.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Upper bound on attempts per operation
    pub attempts: u32,
    /// Fixed delay between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Transfer configuration
#[derive(Clone, Debug)]
pub struct TransferConfig {
    /// Server endpoint URL
    pub endpoint: String,
    /// Plaintext bytes per encryption chunk
    pub chunk_size: usize,
    /// Connect timeout for HTTP requests
    pub connect_timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Retry policy for transport failures
    pub retry: RetryPolicy,
    /// Largest plaintext the memory sink will buffer
    pub memory_sink_max: u64,
    /// Days until an uploaded transfer expires server-side
    pub expiry_days: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(30),
            user_agent: format!("sealdrop-client/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryPolicy::default(),
            memory_sink_max: DEFAULT_MEMORY_SINK_MAX,
            expiry_days: 7,
        }
    }
}

impl TransferConfig {
    /// Create a new config with the given endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Set the plaintext chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        self.chunk_size = chunk_size;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the memory sink threshold
    pub fn with_memory_sink_max(mut self, max: u64) -> Self {
        self.memory_sink_max = max;
        self
    }

    /// Set the server-side expiry in days
    pub fn with_expiry_days(mut self, days: u32) -> Self {
        self.expiry_days = days;
        self
    }

    /// Size of one ciphertext chunk on the wire
    pub fn wire_chunk_size(&self) -> usize {
        self.chunk_size + STREAM_OVERHEAD
    }

    /// URL of the upload initiation endpoint
    pub fn upload_url(&self) -> String {
        format!("{}/api/upload", self.endpoint.trim_end_matches('/'))
    }
}
