//! Resumable encrypted uploads
//!
//! The upload pipeline reads the staged file, assembles encryption-aligned
//! chunks, encrypts each through the push stream, and sends the result with a
//! resumable continuation protocol: the first send initiates the transfer,
//! every later send is a continuation request carrying the committed offset.
//! The protocol is not idempotent, so the cipher position is snapshotted
//! before every chunk: a send that was never acknowledged is rolled back and
//! retried as the byte-identical ciphertext instead of silently
//! desynchronizing cipher state from what the server committed.
//!
//! State machine: `Idle → Initiating → PartialAcked (self-loop) → Completed`,
//! or `Failed { retryable }`.

use crate::{
    config::TransferConfig,
    error::unexpected_status,
    progress::{StatusCallback, TransferStatus},
    ClientError, Result,
};
use bytes::Bytes;
use reqwest::{multipart, Client, StatusCode};
use sealdrop_crypto::{
    ChunkAssembler, ChunkTag, Nonce, PushStream, ShareReference, StreamHeader, TransferKey,
    ENVELOPE_SIZE,
};
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument, warn};
use url::Url;

/// File read span; independent of the encryption chunk size
const READ_SPAN: usize = 64 * 1024;

/// Upload state machine position
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    /// No file staged, or session reset
    Idle,
    /// First send in flight, nothing acknowledged yet
    Initiating,
    /// At least one chunk acknowledged, more to send
    PartialAcked,
    /// Server acknowledged the terminal chunk
    Completed,
    /// A send exhausted its retry budget or hit a fatal error
    Failed {
        /// Whether the session survived and `process` may be called again
        retryable: bool,
    },
}

/// Where a completed upload can be fetched from
#[derive(Clone, Debug)]
pub struct DownloadRef {
    /// Full download URL as observed from the completion response
    pub url: Url,
    /// Server-assigned owner identifier
    pub user_id: String,
    /// Server-assigned file identifier
    pub file_id: String,
}

/// Mutable per-transfer upload accounting
///
/// Counters reflect only durably committed work: they advance strictly after
/// a confirmed transport acknowledgment.
#[derive(Clone, Debug, Default)]
pub struct UploadSession {
    /// Plaintext bytes whose ciphertext the server acknowledged
    pub processed_bytes: u64,
    /// Ciphertext bytes (envelope included) the server acknowledged
    pub uploaded_bytes: u64,
    /// Continuation endpoint issued by the server
    pub location: Option<Url>,
    /// Whether the server confirmed the terminal chunk
    pub complete: bool,
    /// Download reference returned on completion
    pub download: Option<DownloadRef>,
}

struct StagedFile {
    path: PathBuf,
    key: TransferKey,
    nonce: Nonce,
    envelope: [u8; ENVELOPE_SIZE],
    header: StreamHeader,
    push: PushStream,
}

enum SendOutcome {
    Partial { location: Option<Url> },
    Complete(DownloadRef),
}

/// Drives a resumable encrypted upload
///
/// Owns its session counters and cipher state exclusively; `process` takes
/// `&mut self`, so a second call cannot overlap one still in flight.
pub struct UploadManager {
    config: TransferConfig,
    http: Client,
    status: Option<StatusCallback>,
    state: UploadState,
    session: UploadSession,
    staged: Option<StagedFile>,
}

impl UploadManager {
    /// Create a new upload manager
    pub fn new(config: TransferConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            config,
            http,
            status: None,
            state: UploadState::Idle,
            session: UploadSession::default(),
            staged: None,
        })
    }

    /// Register the status callback all progress and terminal states flow
    /// through
    pub fn on_status(&mut self, callback: StatusCallback) {
        self.status = Some(callback);
    }

    /// Stage a file for upload, resetting the session and deriving a fresh
    /// push state and header
    ///
    /// The caller seals the filename into `envelope` beforehand (see
    /// [`sealdrop_crypto::seal_filename`]) with the same key and nonce.
    pub fn set_file(
        &mut self,
        path: impl Into<PathBuf>,
        key: TransferKey,
        nonce: Nonce,
        envelope: [u8; ENVELOPE_SIZE],
    ) {
        let (push, header) = PushStream::init(&key);
        self.session = UploadSession::default();
        self.state = UploadState::Idle;
        self.staged = Some(StagedFile {
            path: path.into(),
            key,
            nonce,
            envelope,
            header,
            push,
        });
    }

    /// Re-stage a file for a session carried over from an earlier run
    ///
    /// Committed plaintext is skipped by seeking, not re-encrypted; the push
    /// stream resumes at the committed chunk boundary.
    pub fn resume_file(
        &mut self,
        path: impl Into<PathBuf>,
        key: TransferKey,
        nonce: Nonce,
        envelope: [u8; ENVELOPE_SIZE],
        header: StreamHeader,
        session: UploadSession,
    ) -> Result<()> {
        if session.processed_bytes % self.config.chunk_size as u64 != 0 && !session.complete {
            return Err(ClientError::Protocol(format!(
                "cannot resume at offset {} with chunk size {}",
                session.processed_bytes, self.config.chunk_size
            )));
        }

        let chunk_index = session.processed_bytes / self.config.chunk_size as u64;
        let push = PushStream::resume_at(&key, &header, chunk_index);
        self.state = if session.uploaded_bytes > 0 {
            UploadState::PartialAcked
        } else {
            UploadState::Idle
        };
        self.session = session;
        self.staged = Some(StagedFile {
            path: path.into(),
            key,
            nonce,
            envelope,
            header,
            push,
        });
        Ok(())
    }

    /// Current state machine position
    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Current session counters
    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    /// Header of the staged stream, when a file is staged
    pub fn stream_header(&self) -> Option<&StreamHeader> {
        self.staged.as_ref().map(|s| &s.header)
    }

    /// Share reference for the staged transfer
    ///
    /// This is what the recipient needs; carry it out-of-band (URL fragment),
    /// never in a request to the server.
    pub fn share_reference(&self) -> Option<ShareReference> {
        self.staged.as_ref().map(|s| {
            ShareReference::new(s.key.clone(), s.header.clone(), s.nonce.clone())
        })
    }

    /// Encrypt and upload the staged file from the committed offset
    ///
    /// Runs to completion or to the first non-retryable error. Transport
    /// errors inside the retry budget are invisible to the caller; an
    /// exhausted budget preserves the session so a later call resumes where
    /// the last acknowledgment left off.
    #[instrument(skip(self), fields(endpoint = %self.config.endpoint))]
    pub async fn process(&mut self) -> Result<DownloadRef> {
        if let Some(done) = &self.session.download {
            return Ok(done.clone());
        }

        let mut staged = self
            .staged
            .take()
            .ok_or_else(|| ClientError::Protocol("no file staged for upload".to_string()))?;

        let result = self.process_staged(&mut staged).await;
        match &result {
            Ok(_) => self.staged = Some(staged),
            Err(err) => {
                // A protocol error invalidates the whole attempt; the stream
                // cannot be continued against an inconsistent server view.
                // Everything else preserves the session for a resume.
                if matches!(err, ClientError::Protocol(_)) {
                    self.session = UploadSession::default();
                } else {
                    self.staged = Some(staged);
                }
                self.state = UploadState::Failed {
                    retryable: err.is_retryable(),
                };
                self.emit(TransferStatus::Failed {
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                });
            }
        }
        result
    }

    async fn process_staged(&mut self, staged: &mut StagedFile) -> Result<DownloadRef> {
        let mut file = tokio::fs::File::open(&staged.path).await?;
        let file_size = file.metadata().await?.len();

        if self.session.processed_bytes > file_size {
            return Err(ClientError::Protocol(format!(
                "session committed {} bytes but file only has {}",
                self.session.processed_bytes, file_size
            )));
        }
        if self.session.processed_bytes > 0 {
            // Committed plaintext was already acknowledged; skip it.
            file.seek(SeekFrom::Start(self.session.processed_bytes)).await?;
        }

        self.state = if self.session.uploaded_bytes == 0 {
            UploadState::Initiating
        } else {
            UploadState::PartialAcked
        };

        let chunk_size = self.config.chunk_size;
        let mut assembler = ChunkAssembler::new();
        let mut read_buf = vec![0u8; READ_SPAN];
        let mut eof = false;

        loop {
            // Buffer until we know whether a full chunk has data behind it.
            while !eof && assembler.len() <= chunk_size {
                let n = file.read(&mut read_buf).await?;
                if n == 0 {
                    eof = true;
                } else {
                    assembler.push(&read_buf[..n]);
                }
            }

            let mut batch: Vec<(Bytes, ChunkTag)> = Vec::new();
            let full_chunks = assembler.drain(chunk_size);
            let drained_all = assembler.is_empty();
            let full_count = full_chunks.len();
            for (i, chunk) in full_chunks.into_iter().enumerate() {
                let tag = if eof && drained_all && i == full_count - 1 {
                    ChunkTag::Final
                } else {
                    ChunkTag::Message
                };
                batch.push((chunk, tag));
            }
            if eof {
                if let Some(rest) = assembler.take_remainder() {
                    batch.push((rest, ChunkTag::Final));
                } else if full_count == 0
                    && self.session.processed_bytes == 0
                    && self.session.uploaded_bytes == 0
                {
                    // A zero-byte file still carries a terminal chunk.
                    batch.push((Bytes::new(), ChunkTag::Final));
                }
            }

            for (chunk, tag) in batch {
                if let Some(reference) = self.send_chunk(staged, file_size, chunk, tag).await? {
                    return Ok(reference);
                }
            }

            if eof {
                break;
            }
        }

        Err(ClientError::Protocol(
            "upload stream ended without a completion acknowledgment".to_string(),
        ))
    }

    /// Encrypt one chunk and send it until acknowledged or out of retries
    async fn send_chunk(
        &mut self,
        staged: &mut StagedFile,
        file_size: u64,
        chunk: Bytes,
        tag: ChunkTag,
    ) -> Result<Option<DownloadRef>> {
        let first = self.session.uploaded_bytes == 0;
        let done = tag.is_final();

        // The push stream cannot be rewound past this chunk once advanced, so
        // hold a snapshot until the send is acknowledged.
        let snapshot = staged.push.snapshot();
        let sealed = staged.push.push(&chunk, tag)?;
        let payload = if first {
            let mut combined = Vec::with_capacity(ENVELOPE_SIZE + sealed.len());
            combined.extend_from_slice(&staged.envelope);
            combined.extend_from_slice(&sealed);
            combined
        } else {
            sealed
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = if first {
                self.send_initial(&payload, done).await
            } else {
                self.send_continuation(&payload, done).await
            };

            match outcome {
                Ok(SendOutcome::Partial { location }) => {
                    if location.is_none() && self.session.location.is_none() {
                        staged.push.restore(snapshot);
                        return Err(ClientError::Protocol(
                            "partial acknowledgment without a continuation location".to_string(),
                        ));
                    }
                    if let Some(location) = location {
                        self.session.location = Some(location);
                    }
                    self.commit(payload.len(), chunk.len(), file_size);
                    self.state = UploadState::PartialAcked;
                    return Ok(None);
                }
                Ok(SendOutcome::Complete(reference)) => {
                    if !done {
                        // The server believes the transfer is over while we
                        // still hold plaintext; the views cannot be
                        // reconciled.
                        staged.push.restore(snapshot);
                        return Err(ClientError::Protocol(
                            "server completed the upload before the terminal chunk".to_string(),
                        ));
                    }
                    self.commit(payload.len(), chunk.len(), file_size);
                    self.session.complete = true;
                    self.session.download = Some(reference.clone());
                    self.state = UploadState::Completed;
                    self.emit(TransferStatus::Completed);
                    return Ok(Some(reference));
                }
                Err(err) if err.is_retryable() && attempt < self.config.retry.attempts => {
                    warn!(attempt, error = %err, "chunk send failed, retrying");
                    tokio::time::sleep(self.config.retry.backoff).await;
                }
                Err(err) => {
                    // Never acknowledged: roll back so a retry re-encrypts
                    // the identical ciphertext from the same offset.
                    staged.push.restore(snapshot);
                    return Err(err);
                }
            }
        }
    }

    fn commit(&mut self, payload_len: usize, plaintext_len: usize, file_size: u64) {
        self.session.uploaded_bytes += payload_len as u64;
        self.session.processed_bytes += plaintext_len as u64;
        self.emit(TransferStatus::Progress {
            bytes: self.session.processed_bytes,
            total: Some(file_size),
        });
    }

    async fn send_initial(&self, payload: &[u8], done: bool) -> Result<SendOutcome> {
        let url = self.config.upload_url();
        let expiry = (chrono::Utc::now() + chrono::Duration::days(self.config.expiry_days as i64))
            .format("%Y-%m-%d")
            .to_string();

        let form = multipart::Form::new()
            .part(
                "file",
                multipart::Part::bytes(payload.to_vec()).file_name("data.bin"),
            )
            .text("expiry-date", expiry);

        let mut request = self
            .http
            .post(&url)
            .multipart(form)
            .header("Upload-Complete", complete_field(done));
        if !done {
            request = request.header("Chunk-Size", self.config.wire_chunk_size().to_string());
        }

        debug!(%url, done, bytes = payload.len(), "initiating upload");
        let response = request.send().await?;
        self.interpret_response(response, done).await
    }

    async fn send_continuation(&self, payload: &[u8], done: bool) -> Result<SendOutcome> {
        let location = self.session.location.clone().ok_or_else(|| {
            ClientError::Protocol("continuation send without a continuation location".to_string())
        })?;

        let form = multipart::Form::new().part(
            "file",
            multipart::Part::bytes(payload.to_vec()).file_name("data.bin"),
        );

        debug!(
            %location,
            done,
            bytes = payload.len(),
            offset = self.session.uploaded_bytes,
            "sending continuation"
        );
        let response = self
            .http
            .patch(location)
            .multipart(form)
            .header("Upload-Complete", complete_field(done))
            .header("Upload-Offset", self.session.uploaded_bytes.to_string())
            .send()
            .await?;
        self.interpret_response(response, done).await
    }

    async fn interpret_response(
        &self,
        response: reqwest::Response,
        done: bool,
    ) -> Result<SendOutcome> {
        match response.status() {
            StatusCode::ACCEPTED if !done => {
                let location = match response.headers().get(reqwest::header::LOCATION) {
                    Some(value) => {
                        let raw = value.to_str().map_err(|_| {
                            ClientError::Protocol(
                                "continuation location is not valid ascii".to_string(),
                            )
                        })?;
                        Some(response.url().join(raw)?)
                    }
                    None => None,
                };
                Ok(SendOutcome::Partial { location })
            }
            StatusCode::OK => Ok(SendOutcome::Complete(parse_download_ref(response.url())?)),
            _ => Err(unexpected_status(response).await),
        }
    }

    fn emit(&self, status: TransferStatus) {
        if let Some(callback) = &self.status {
            callback(status);
        }
    }
}

/// RFC 8941 boolean, as the wire contract spells it
fn complete_field(done: bool) -> &'static str {
    if done {
        "?1"
    } else {
        "?0"
    }
}

/// Pull the download identifiers out of the completion response URL
fn parse_download_ref(url: &Url) -> Result<DownloadRef> {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    let position = segments
        .iter()
        .position(|segment| *segment == "download")
        .ok_or_else(|| {
            ClientError::Protocol(format!(
                "completion response URL does not reference a download: {}",
                url
            ))
        })?;

    match (segments.get(position + 1), segments.get(position + 2)) {
        (Some(user_id), Some(file_id)) => Ok(DownloadRef {
            url: url.clone(),
            user_id: (*user_id).to_string(),
            file_id: (*file_id).to_string(),
        }),
        _ => Err(ClientError::Protocol(format!(
            "completion response URL is missing download identifiers: {}",
            url
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_download_ref() {
        let url = Url::parse("http://host.test/download/user42/file99").unwrap();
        let reference = parse_download_ref(&url).unwrap();
        assert_eq!(reference.user_id, "user42");
        assert_eq!(reference.file_id, "file99");
    }

    #[test]
    fn test_parse_download_ref_rejects_other_paths() {
        let url = Url::parse("http://host.test/api/upload/user42/file99").unwrap();
        assert!(parse_download_ref(&url).is_err());

        let url = Url::parse("http://host.test/download/user42").unwrap();
        assert!(parse_download_ref(&url).is_err());
    }

    #[test]
    fn test_complete_field() {
        assert_eq!(complete_field(true), "?1");
        assert_eq!(complete_field(false), "?0");
    }

    #[test]
    fn test_set_file_resets_session() {
        let mut manager = UploadManager::new(TransferConfig::new("http://host.test")).unwrap();
        let key = TransferKey::generate();
        let nonce = Nonce::generate();
        let envelope = sealdrop_crypto::seal_filename("a.txt", &key, &nonce).unwrap();

        manager.set_file("/tmp/a.txt", key.clone(), nonce.clone(), envelope);
        assert_eq!(manager.state(), UploadState::Idle);
        assert_eq!(manager.session().processed_bytes, 0);
        assert!(manager.stream_header().is_some());
        assert!(manager.share_reference().is_some());

        let envelope = sealdrop_crypto::seal_filename("b.txt", &key, &nonce).unwrap();
        let first_header = manager.stream_header().unwrap().clone();
        manager.set_file("/tmp/b.txt", key, nonce, envelope);
        // A fresh file derives a fresh stream.
        assert_ne!(manager.stream_header().unwrap(), &first_header);
    }

    #[test]
    fn test_resume_rejects_unaligned_offset() {
        let config = TransferConfig::new("http://host.test").with_chunk_size(1024);
        let mut manager = UploadManager::new(config).unwrap();
        let key = TransferKey::generate();
        let nonce = Nonce::generate();
        let envelope = sealdrop_crypto::seal_filename("a.txt", &key, &nonce).unwrap();
        let (_, header) = PushStream::init(&key);

        let session = UploadSession {
            processed_bytes: 1500,
            uploaded_bytes: 2000,
            ..Default::default()
        };
        let result = manager.resume_file("/tmp/a.txt", key, nonce, envelope, header, session);
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }
}
