//! Delivery sinks for decrypted plaintext
//!
//! A download hands every decrypted chunk to a [`Sink`] so an arbitrarily
//! large plaintext stream can reach durable storage without ever being held
//! in memory as a whole. Three variants cover the capability tiers:
//!
//! - [`MemorySink`] buffers everything and offers the assembled result as one
//!   object; only sensible below a size threshold
//! - [`StorageSink`] pipes directly into a user-granted writable path
//! - [`RelaySink`](crate::relay::RelaySink) hands chunks to a local relay hub
//!   that a native download mechanism drains by an opaque identifier
//!
//! [`SinkPolicy`] picks the tier, falling back through the chain
//! storage → memory → relay; an unavailable tier is consumed by the policy,
//! not surfaced to the caller.

use crate::{relay::RelayHub, ClientError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// What a sink produced once the stream completed
#[derive(Debug)]
pub enum Delivery {
    /// The whole plaintext, assembled in memory
    Buffered(Bytes),
    /// Plaintext was written to storage
    Stored {
        /// Final path of the written file
        path: PathBuf,
        /// Bytes written
        bytes_written: u64,
    },
    /// Plaintext was streamed through the relay hub
    Relayed {
        /// Identifier the native downloader used to claim the stream
        id: String,
        /// Bytes streamed
        bytes_streamed: u64,
    },
}

/// Delivery target for decrypted chunks
#[async_trait]
pub trait Sink: Send {
    /// Deliver one plaintext chunk, in stream order
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Finish the stream and report what was delivered
    async fn finish(self: Box<Self>) -> Result<Delivery>;

    /// Whether the sink can no longer accept writes
    ///
    /// Checked by the download manager at loop boundaries; a cancelled sink
    /// cancels the transfer.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Buffers all plaintext chunks in memory
#[derive(Default)]
pub struct MemorySink {
    buffer: BytesMut,
}

impl MemorySink {
    /// Create an empty memory sink
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<Delivery> {
        Ok(Delivery::Buffered(self.buffer.freeze()))
    }
}

/// Pipes plaintext directly into a writable file
pub struct StorageSink {
    file: tokio::fs::File,
    path: PathBuf,
    bytes_written: u64,
}

impl StorageSink {
    /// Open a storage sink at the given path
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            file,
            path,
            bytes_written: 0,
        })
    }
}

#[async_trait]
impl Sink for StorageSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.file.write_all(&chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<Delivery> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(Delivery::Stored {
            path: self.path,
            bytes_written: self.bytes_written,
        })
    }
}

/// Environment capabilities available to the sink policy
#[derive(Clone, Default)]
pub struct Capabilities {
    /// Directory the environment granted for direct storage writes
    pub storage_dir: Option<PathBuf>,
    /// Relay hub, when a native streaming downloader is wired up
    pub relay: Option<Arc<RelayHub>>,
}

/// Selects a delivery sink by capability and size
///
/// Lives outside the managers: a download asks the policy for a sink once the
/// plaintext size and filename are known.
pub struct SinkPolicy {
    capabilities: Capabilities,
    memory_max: u64,
}

impl SinkPolicy {
    /// Create a policy over the given capabilities
    pub fn new(capabilities: Capabilities, memory_max: u64) -> Self {
        Self {
            capabilities,
            memory_max,
        }
    }

    /// Pick a sink for a stream of `plaintext_size` bytes
    ///
    /// Falls through the chain storage → memory → relay. Only when no tier is
    /// available does the caller see a capability error.
    pub async fn select(&self, plaintext_size: u64, filename: &str) -> Result<Box<dyn Sink>> {
        if let Some(dir) = &self.capabilities.storage_dir {
            let path = dir.join(sanitize_filename(filename));
            match StorageSink::create(&path).await {
                Ok(sink) => {
                    debug!(path = %path.display(), "selected storage sink");
                    return Ok(Box::new(sink));
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "storage sink unavailable, falling back");
                }
            }
        }

        if plaintext_size <= self.memory_max {
            debug!(plaintext_size, "selected memory sink");
            return Ok(Box::new(MemorySink::new()));
        }

        if let Some(hub) = &self.capabilities.relay {
            let sink = hub.register(filename)?;
            debug!(id = %sink.id(), "selected relay sink");
            return Ok(Box::new(sink));
        }

        Err(ClientError::Capability(format!(
            "no delivery sink can accept {} bytes in this environment",
            plaintext_size
        )))
    }
}

/// Strip path components so a served filename cannot escape the target
/// directory.
fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base.is_empty() || base == ".." || base == "." {
        "download.bin".to_string()
    } else {
        base
    }
}
