//! Local streaming relay
//!
//! When neither buffering in memory nor a direct storage handle is available,
//! decrypted chunks are relayed through a local hub that the platform's
//! native download mechanism drains by an opaque identifier. The hub holds at
//! most one in-flight stream per identifier: claiming a stream removes it, so
//! a second claim of the same identifier finds nothing.
//!
//! Backpressure and cancellation both ride on the bounded channel between the
//! [`RelaySink`] and the [`RelayStream`]: a slow consumer suspends the
//! producer, and a dropped consumer surfaces as a cancellation signal the
//! download manager observes at its next loop boundary.

use crate::{
    sink::{Delivery, Sink},
    ClientError, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

/// Depth of the bounded channel between producer and consumer
pub const RELAY_QUEUE_DEPTH: usize = 16;

struct PendingStream {
    filename: String,
    rx: mpsc::Receiver<Bytes>,
}

/// Registry of relayed download streams, keyed by opaque identifier
pub struct RelayHub {
    streams: DashMap<String, PendingStream>,
    announce: broadcast::Sender<String>,
}

impl Default for RelayHub {
    fn default() -> Self {
        let (announce, _) = broadcast::channel(RELAY_QUEUE_DEPTH);
        Self {
            streams: DashMap::new(),
            announce,
        }
    }
}

impl RelayHub {
    /// Create a new hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to registration announcements
    ///
    /// The native download mechanism listens here to learn the identifier of
    /// a freshly registered stream.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.announce.subscribe()
    }

    /// Register a new relayed stream and get the producing sink
    pub fn register(&self, filename: &str) -> Result<RelaySink> {
        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(RELAY_QUEUE_DEPTH);

        let previous = self.streams.insert(
            id.clone(),
            PendingStream {
                filename: filename.to_string(),
                rx,
            },
        );
        if previous.is_some() {
            return Err(ClientError::Capability(format!(
                "relay identifier {} already in flight",
                id
            )));
        }

        debug!(%id, filename, "registered relay stream");
        // Nobody listening is fine; the id can also travel out-of-band.
        let _ = self.announce.send(id.clone());
        Ok(RelaySink {
            id,
            tx,
            bytes_streamed: 0,
        })
    }

    /// Claim a registered stream for consumption
    ///
    /// Removes the entry, so each identifier can be claimed exactly once.
    pub fn claim(&self, id: &str) -> Option<RelayStream> {
        self.streams.remove(id).map(|(_, pending)| RelayStream {
            filename: pending.filename,
            rx: pending.rx,
        })
    }

    /// Drop a registered stream that was never claimed
    ///
    /// The producing sink observes the closed channel as a cancellation.
    pub fn abort(&self, id: &str) {
        if self.streams.remove(id).is_some() {
            debug!(%id, "aborted relay stream");
        }
    }

    /// Number of streams registered but not yet claimed
    pub fn pending(&self) -> usize {
        self.streams.len()
    }
}

/// Consumer side of a relayed download
pub struct RelayStream {
    filename: String,
    rx: mpsc::Receiver<Bytes>,
}

impl RelayStream {
    /// Filename the stream was registered under
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Receive the next plaintext chunk; `None` once the stream finished
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Producer side: a [`Sink`] that relays plaintext through the hub
pub struct RelaySink {
    id: String,
    tx: mpsc::Sender<Bytes>,
    bytes_streamed: u64,
}

impl RelaySink {
    /// The opaque identifier the consumer claims this stream by
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Sink for RelaySink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        let len = chunk.len() as u64;
        self.tx
            .send(chunk)
            .await
            .map_err(|_| ClientError::Cancelled)?;
        self.bytes_streamed += len;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<Delivery> {
        // Dropping the sender closes the stream on the consumer side.
        Ok(Delivery::Relayed {
            id: self.id,
            bytes_streamed: self.bytes_streamed,
        })
    }

    fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_roundtrip() {
        let hub = RelayHub::new();
        let mut sink = hub.register("movie.mkv").unwrap();
        let id = sink.id().to_string();

        let mut stream = hub.claim(&id).unwrap();
        assert_eq!(stream.filename(), "movie.mkv");

        let producer = tokio::spawn(async move {
            sink.write(Bytes::from_static(b"part one ")).await.unwrap();
            sink.write(Bytes::from_static(b"part two")).await.unwrap();
            Box::new(sink).finish().await.unwrap()
        });

        let mut received = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"part one part two");

        match producer.await.unwrap() {
            Delivery::Relayed {
                id: delivered,
                bytes_streamed,
            } => {
                assert_eq!(delivered, id);
                assert_eq!(bytes_streamed, 17);
            }
            other => panic!("expected relayed delivery, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_claim_is_single_use() {
        let hub = RelayHub::new();
        let sink = hub.register("file.bin").unwrap();
        let id = sink.id().to_string();

        assert!(hub.claim(&id).is_some());
        assert!(hub.claim(&id).is_none());
        assert_eq!(hub.pending(), 0);
    }

    #[tokio::test]
    async fn test_dropped_consumer_cancels_sink() {
        let hub = RelayHub::new();
        let mut sink = hub.register("file.bin").unwrap();
        let id = sink.id().to_string();

        let stream = hub.claim(&id).unwrap();
        drop(stream);

        assert!(sink.is_cancelled());
        let result = sink.write(Bytes::from_static(b"data")).await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn test_abort_unclaimed_stream() {
        let hub = RelayHub::new();
        let sink = hub.register("file.bin").unwrap();
        let id = sink.id().to_string();

        hub.abort(&id);
        assert!(sink.is_cancelled());
        assert!(hub.claim(&id).is_none());
    }
}
