//! Idempotent encrypted downloads
//!
//! Downloads are ranged reads: the first span carries the 512-byte filename
//! envelope ahead of the leading ciphertext chunk, the remainder is an
//! open-ended ranged read streamed through a bounded queue into the
//! assembler, the pull stream, and finally the attached delivery sink. Unlike
//! uploads there is no continuation handshake: after a transport failure the
//! manager simply re-issues the ranged read from the committed offset.
//!
//! Completion is driven by the cipher's terminal tag. Reaching the advertised
//! total size is a consistency check only; a mismatch is a protocol error,
//! never a silent early termination.
//!
//! State machine: `Idle → Fetching(offset) → Draining → Completed`, or
//! `Cancelled | Failed { retryable }`.

use crate::{
    config::TransferConfig,
    error::unexpected_status,
    progress::{StatusCallback, TransferStatus},
    sink::{Delivery, Sink},
    ClientError, Result,
};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use sealdrop_crypto::{open_filename, ChunkAssembler, PullStream, ShareReference, ENVELOPE_SIZE, STREAM_OVERHEAD};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use url::Url;

/// Depth of the bounded queue between the network reader and the
/// assembler/cipher/sink consumer
const RAW_QUEUE_DEPTH: usize = 16;

/// Download state machine position
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadState {
    /// Nothing fetched yet, or session reset
    Idle,
    /// A ranged read is in flight
    Fetching,
    /// Buffered ciphertext is being decrypted into the sink
    Draining,
    /// Terminal tag consumed and consistency checks passed
    Completed,
    /// Cooperatively cancelled; session was fully reset
    Cancelled,
    /// A fatal error or an exhausted retry budget
    Failed {
        /// Whether the session survived and `resume` may be called again
        retryable: bool,
    },
}

/// Mutable per-transfer download accounting
///
/// `bytes_downloaded` counts wire bytes (envelope included) whose decrypted
/// content the sink has consumed, never bytes merely buffered.
#[derive(Clone, Debug, Default)]
pub struct DownloadSession {
    /// Committed wire offset
    pub bytes_downloaded: u64,
    /// Total wire size advertised by the server
    pub total_size: Option<u64>,
}

/// Cooperative cancellation handle for a download
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Request cancellation; observed at the manager's next loop boundary
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Drives an idempotent encrypted download
///
/// Owns its session counters and cipher state exclusively; all driving
/// methods take `&mut self`, so operations on one session cannot overlap.
pub struct DownloadManager {
    config: TransferConfig,
    http: Client,
    url: Url,
    reference: ShareReference,
    status: Option<StatusCallback>,
    state: DownloadState,
    session: DownloadSession,
    pull: Option<PullStream>,
    assembler: ChunkAssembler,
    filename: Option<String>,
    sink: Option<Box<dyn Sink>>,
    cancel: CancelHandle,
    finished: bool,
}

impl DownloadManager {
    /// Create a manager for the transfer at `url`, decrypting with the share
    /// reference the sender handed over out-of-band
    pub fn new(config: TransferConfig, url: Url, reference: ShareReference) -> Result<Self> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            config,
            http,
            url,
            reference,
            status: None,
            state: DownloadState::Idle,
            session: DownloadSession::default(),
            pull: None,
            assembler: ChunkAssembler::new(),
            filename: None,
            sink: None,
            cancel: CancelHandle::default(),
            finished: false,
        })
    }

    /// Register the status callback all progress and terminal states flow
    /// through
    pub fn on_status(&mut self, callback: StatusCallback) {
        self.status = Some(callback);
    }

    /// Handle for cancelling this download from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Current state machine position
    pub fn state(&self) -> DownloadState {
        self.state
    }

    /// Current session counters
    pub fn session(&self) -> &DownloadSession {
        &self.session
    }

    /// Decrypted filename, once the first span was fetched
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Decrypted plaintext size implied by the advertised wire size
    ///
    /// Used by the sink policy before any plaintext exists.
    pub fn plaintext_size(&self) -> Option<u64> {
        let total = self.session.total_size?;
        let body = total.checked_sub(ENVELOPE_SIZE as u64)?;
        let wire_chunk = self.config.wire_chunk_size() as u64;
        let full_chunks = body / wire_chunk;
        let tail = body % wire_chunk;
        let tail_plain = tail.checked_sub(STREAM_OVERHEAD as u64).unwrap_or(0);
        Some(full_chunks * self.config.chunk_size as u64 + tail_plain)
    }

    /// Discover the total wire size with a `HEAD` request
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn fetch_total_size(&mut self) -> Result<u64> {
        if let Some(total) = self.session.total_size {
            return Ok(total);
        }

        let mut attempt = 0u32;
        let total = loop {
            attempt += 1;
            match self.head_once().await {
                Ok(total) => break total,
                Err(err) if err.is_retryable() && attempt < self.config.retry.attempts => {
                    warn!(attempt, error = %err, "size discovery failed, retrying");
                    tokio::time::sleep(self.config.retry.backoff).await;
                }
                Err(err) => return Err(self.fail_with(err)),
            }
        };
        self.session.total_size = Some(total);
        Ok(total)
    }

    /// Fetch the first span: the filename envelope plus the leading
    /// ciphertext chunk
    ///
    /// Returns the decrypted filename. The leading ciphertext stays buffered
    /// until a sink is attached via [`fetch_remainder`](Self::fetch_remainder).
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn fetch_first_span(&mut self) -> Result<String> {
        if let Some(name) = &self.filename {
            return Ok(name.clone());
        }

        self.fetch_total_size().await?;
        self.state = DownloadState::Fetching;

        let span_len = ENVELOPE_SIZE + self.config.wire_chunk_size();
        let range = format!("bytes=0-{}", span_len - 1);
        let mut attempt = 0u32;
        let body = loop {
            attempt += 1;
            match self.span_once(&range).await {
                Ok(body) => break body,
                Err(err) if err.is_retryable() && attempt < self.config.retry.attempts => {
                    warn!(attempt, error = %err, "first span fetch failed, retrying");
                    tokio::time::sleep(self.config.retry.backoff).await;
                }
                Err(err) => return Err(self.fail_with(err)),
            }
        };

        if body.len() < ENVELOPE_SIZE + STREAM_OVERHEAD {
            let err = ClientError::Protocol(format!(
                "first span of {} bytes cannot hold an envelope and a chunk",
                body.len()
            ));
            return Err(self.fail(err));
        }

        let name = match open_filename(
            &body[..ENVELOPE_SIZE],
            &self.reference.key,
            &self.reference.nonce,
        ) {
            Ok(name) => name,
            Err(err) => return Err(self.fail(err.into())),
        };

        self.pull = Some(PullStream::init(&self.reference.header, &self.reference.key));
        self.session.bytes_downloaded = ENVELOPE_SIZE as u64;
        self.assembler.reset();
        self.assembler.push(&body[ENVELOPE_SIZE..]);
        self.filename = Some(name.clone());
        debug!(filename = %name, "first span fetched");
        Ok(name)
    }

    /// Attach a sink and stream the rest of the transfer through it
    ///
    /// On a retryable failure the sink stays attached and
    /// [`resume`](Self::resume) continues from the committed offset.
    pub async fn fetch_remainder(&mut self, sink: Box<dyn Sink>) -> Result<Delivery> {
        self.sink = Some(sink);
        self.resume().await
    }

    /// Continue streaming into the attached sink from the committed offset
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn resume(&mut self) -> Result<Delivery> {
        if self.pull.is_none() {
            return Err(ClientError::Protocol(
                "fetch the first span before the remainder".to_string(),
            ));
        }
        let mut sink = self.sink.take().ok_or_else(|| {
            ClientError::Protocol("no delivery sink attached".to_string())
        })?;

        match self.drive(&mut sink).await {
            Ok(()) => {
                self.state = DownloadState::Completed;
                let delivery = sink.finish().await?;
                self.emit(TransferStatus::Completed);
                Ok(delivery)
            }
            Err(ClientError::Cancelled) => {
                // A relay sink cannot be reattached mid-stream, so a
                // cancelled session is reset, not resumed.
                self.state = DownloadState::Cancelled;
                self.emit(TransferStatus::Cancelled);
                self.reset();
                Err(ClientError::Cancelled)
            }
            Err(err) => {
                let retryable = err.is_retryable();
                self.state = DownloadState::Failed { retryable };
                self.emit(TransferStatus::Failed {
                    message: err.to_string(),
                    retryable,
                });
                if retryable {
                    self.sink = Some(sink);
                } else {
                    self.reset();
                }
                Err(err)
            }
        }
    }

    /// Pump ciphertext through assembler → pull → sink until the terminal tag
    async fn drive(&mut self, sink: &mut Box<dyn Sink>) -> Result<()> {
        let total = self.session.total_size.ok_or_else(|| {
            ClientError::Protocol("total size unknown before remainder fetch".to_string())
        })?;
        let wire_chunk = self.config.wire_chunk_size();
        let mut stalls = 0u32;

        while !self.finished {
            if self.cancel.is_cancelled() || sink.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            // Consume ciphertext already buffered (first span leftovers, or
            // bytes queued ahead of the cipher).
            self.state = DownloadState::Draining;
            let ready = self.assembler.drain(wire_chunk);
            for chunk in ready {
                self.consume_chunk(sink.as_mut(), chunk).await?;
                if self.finished {
                    break;
                }
            }
            if self.finished {
                break;
            }

            let offset = self.session.bytes_downloaded + self.assembler.len() as u64;
            if offset >= total {
                if offset > total {
                    return Err(ClientError::Protocol(format!(
                        "server sent {} bytes beyond the advertised size",
                        offset - total
                    )));
                }
                // The genuine trailing chunk is the only partial one.
                if let Some(rest) = self.assembler.take_remainder() {
                    self.consume_chunk(sink.as_mut(), rest).await?;
                }
                if self.finished {
                    break;
                }
                return Err(ClientError::Protocol(
                    "stream ended without a terminal tag".to_string(),
                ));
            }

            self.state = DownloadState::Fetching;
            let committed_before = self.session.bytes_downloaded;
            match self.stream_span(offset, sink.as_mut()).await {
                Ok(()) => {
                    let after = self.session.bytes_downloaded + self.assembler.len() as u64;
                    if after > offset {
                        stalls = 0;
                        continue;
                    }
                    stalls += 1;
                    if stalls >= self.config.retry.attempts {
                        return Err(ClientError::Protocol(format!(
                            "no data past offset {} though the server advertised {}",
                            offset, total
                        )));
                    }
                    tokio::time::sleep(self.config.retry.backoff).await;
                }
                Err(err) if err.is_retryable() => {
                    if self.session.bytes_downloaded > committed_before {
                        stalls = 0;
                    } else {
                        stalls += 1;
                    }
                    if stalls >= self.config.retry.attempts {
                        return Err(err);
                    }
                    warn!(error = %err, offset = self.session.bytes_downloaded, "ranged read failed, re-issuing from committed offset");
                    // Buffered uncommitted ciphertext will be fetched again.
                    self.assembler.reset();
                    tokio::time::sleep(self.config.retry.backoff).await;
                }
                Err(err) => return Err(err),
            }
        }

        // Terminal tag is authoritative; the advertised size must agree.
        if self.session.bytes_downloaded != total {
            return Err(ClientError::Protocol(format!(
                "terminal tag after {} bytes but server advertised {}",
                self.session.bytes_downloaded, total
            )));
        }
        if !self.assembler.is_empty() {
            return Err(ClientError::Protocol(
                "ciphertext after the terminal tag".to_string(),
            ));
        }
        Ok(())
    }

    /// One open-ended ranged read, streamed through the bounded queue
    async fn stream_span(&mut self, offset: u64, sink: &mut dyn Sink) -> Result<()> {
        let range = format!("bytes={}-", offset);
        debug!(%range, "fetching remainder span");
        let response = self
            .http
            .get(self.url.clone())
            .header(header::RANGE, &range)
            .send()
            .await?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(unexpected_status(response).await);
        }

        let mut body = response.bytes_stream();
        let (tx, mut rx) =
            mpsc::channel::<std::result::Result<Bytes, reqwest::Error>>(RAW_QUEUE_DEPTH);

        // Network reader: pushes raw spans and wakes the blocked consumer;
        // parks when the queue is full.
        tokio::spawn(async move {
            while let Some(item) = body.next().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        let wire_chunk = self.config.wire_chunk_size();
        while let Some(item) = rx.recv().await {
            if self.cancel.is_cancelled() || sink.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let bytes = item?;
            self.assembler.push(&bytes);
            let ready = self.assembler.drain(wire_chunk);
            for chunk in ready {
                self.consume_chunk(sink, chunk).await?;
                if self.finished {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Decrypt one wire chunk and commit it to the sink
    async fn consume_chunk(&mut self, sink: &mut dyn Sink, chunk: Bytes) -> Result<()> {
        let snapshot;
        let pulled = {
            let pull = self.pull.as_mut().ok_or_else(|| {
                ClientError::Protocol("decryption stream not initialized".to_string())
            })?;
            snapshot = pull.snapshot();
            pull.pull(&chunk)
        };
        let (plaintext, tag) = pulled?;

        if !plaintext.is_empty() {
            if let Err(err) = sink.write(Bytes::from(plaintext)).await {
                // The sink never saw this chunk; roll the cipher back so a
                // re-fetch from the committed offset lines up again.
                if let Some(pull) = self.pull.as_mut() {
                    pull.restore(snapshot);
                }
                return Err(err);
            }
        }

        self.session.bytes_downloaded += chunk.len() as u64;
        self.emit(TransferStatus::Progress {
            bytes: self.session.bytes_downloaded,
            total: self.session.total_size,
        });
        if tag.is_final() {
            self.finished = true;
        }
        Ok(())
    }

    async fn head_once(&self) -> Result<u64> {
        let response = self.http.head(self.url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(unexpected_status(response).await);
        }
        response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| {
                ClientError::Protocol("server did not advertise a content length".to_string())
            })
    }

    async fn span_once(&self, range: &str) -> Result<Bytes> {
        let response = self
            .http
            .get(self.url.clone())
            .header(header::RANGE, range)
            .send()
            .await?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(unexpected_status(response).await);
        }
        Ok(response.bytes().await?)
    }

    /// Mark the session failed, preserving it only for retryable errors
    fn fail_with(&mut self, err: ClientError) -> ClientError {
        let retryable = err.is_retryable();
        self.state = DownloadState::Failed { retryable };
        self.emit(TransferStatus::Failed {
            message: err.to_string(),
            retryable,
        });
        err
    }

    /// Mark the session failed without preserving it
    fn fail(&mut self, err: ClientError) -> ClientError {
        self.state = DownloadState::Failed { retryable: false };
        self.emit(TransferStatus::Failed {
            message: err.to_string(),
            retryable: false,
        });
        err
    }

    /// Fully reset session state; nothing about the prior attempt survives
    fn reset(&mut self) {
        self.session = DownloadSession::default();
        self.pull = None;
        self.assembler.reset();
        self.filename = None;
        self.sink = None;
        self.finished = false;
        self.cancel = CancelHandle::default();
    }

    fn emit(&self, status: TransferStatus) {
        if let Some(callback) = &self.status {
            callback(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealdrop_crypto::{Nonce, PushStream, TransferKey};

    fn manager(chunk_size: usize) -> DownloadManager {
        let key = TransferKey::generate();
        let (_, header) = PushStream::init(&key);
        let reference = ShareReference::new(key, header, Nonce::generate());
        DownloadManager::new(
            TransferConfig::new("http://host.test").with_chunk_size(chunk_size),
            Url::parse("http://host.test/api/v1/download/u/f").unwrap(),
            reference,
        )
        .unwrap()
    }

    #[test]
    fn test_plaintext_size_estimate() {
        let mut m = manager(1024);
        assert_eq!(m.plaintext_size(), None);

        // Two full chunks and a 28-byte tail.
        let wire_chunk = (1024 + STREAM_OVERHEAD) as u64;
        m.session.total_size =
            Some(ENVELOPE_SIZE as u64 + 2 * wire_chunk + 28 + STREAM_OVERHEAD as u64);
        assert_eq!(m.plaintext_size(), Some(2 * 1024 + 28));

        // A single short chunk.
        m.session.total_size = Some(ENVELOPE_SIZE as u64 + 28 + STREAM_OVERHEAD as u64);
        assert_eq!(m.plaintext_size(), Some(28));
    }

    #[test]
    fn test_cancel_handle_is_shared() {
        let m = manager(1024);
        let handle = m.cancel_handle();
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(m.cancel.is_cancelled());
    }
}
