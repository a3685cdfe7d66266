//! Streaming authenticated encryption
//!
//! A stateful push/pull construct over XChaCha20-Poly1305. The encryptor
//! emits an opaque [`StreamHeader`] once per transfer; both sides then derive
//! a fresh nonce per chunk from the header and a rolling chunk counter, with
//! the counter bound into the AEAD as associated data. Each chunk carries a
//! one-byte tag inside the sealed payload; [`ChunkTag::Final`] marks
//! end-of-stream independent of transport EOF.
//!
//! Chunks must be pushed and pulled in strict sequence. State advances with
//! every call and cannot be rewound except by restoring a previously saved
//! [`StreamSnapshot`]. Encryption is deterministic given a state, so a chunk
//! whose transmission was never acknowledged can be rolled back and
//! re-encrypted to the identical ciphertext.

use crate::{keys::TransferKey, CryptoError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;

/// Size of the stream header in bytes
pub const HEADER_SIZE: usize = 24;

/// Per-chunk ciphertext overhead: one tag byte plus the 16-byte MAC
pub const STREAM_OVERHEAD: usize = 17;

/// Tag carried inside each sealed chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkTag {
    /// An ordinary chunk; more follow
    Message = 0,
    /// The last chunk of the stream
    Final = 3,
}

impl ChunkTag {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Message),
            3 => Ok(Self::Final),
            other => Err(CryptoError::InvalidCiphertext(format!(
                "unknown chunk tag {}",
                other
            ))),
        }
    }

    /// Whether this tag terminates the stream
    pub fn is_final(self) -> bool {
        matches!(self, Self::Final)
    }
}

/// Opaque value emitted once by the encryptor, required to initialize the
/// decryptor. Created once per transfer; immutable thereafter.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamHeader {
    bytes: [u8; HEADER_SIZE],
}

impl StreamHeader {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(CryptoError::InvalidHeader(format!(
                "stream header must be {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; HEADER_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the header bytes
    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for StreamHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use base64::Engine;
        write!(
            f,
            "StreamHeader({})",
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.bytes)
        )
    }
}

/// A saved cipher position that a stream can be rolled back to
///
/// Snapshots are cheap: the construct's state is fully determined by the key,
/// the header, and the chunk counter.
#[derive(Clone, Copy, Debug)]
pub struct StreamSnapshot {
    counter: u64,
}

/// Encryption side of the stream
pub struct PushStream {
    cipher: XChaCha20Poly1305,
    header: StreamHeader,
    counter: u64,
}

impl PushStream {
    /// Initialize a fresh push stream, emitting the header the decryptor
    /// will need
    pub fn init(key: &TransferKey) -> (Self, StreamHeader) {
        let mut bytes = [0u8; HEADER_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut bytes);
        let header = StreamHeader { bytes };

        let stream = Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
            header: header.clone(),
            counter: 0,
        };
        (stream, header)
    }

    /// Rebuild a push stream positioned at `chunk_index`
    ///
    /// Used when resuming an interrupted upload after a restart: chunks below
    /// `chunk_index` were already committed and acknowledged, so their
    /// plaintext is skipped rather than re-encrypted.
    pub fn resume_at(key: &TransferKey, header: &StreamHeader, chunk_index: u64) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
            header: header.clone(),
            counter: chunk_index,
        }
    }

    /// Save the current cipher position
    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            counter: self.counter,
        }
    }

    /// Roll back to a previously saved position
    pub fn restore(&mut self, snapshot: StreamSnapshot) {
        self.counter = snapshot.counter;
    }

    /// Index of the next chunk to be encrypted
    pub fn chunk_index(&self) -> u64 {
        self.counter
    }

    /// Encrypt the next chunk in sequence
    ///
    /// Output length is `plaintext.len() + STREAM_OVERHEAD`.
    pub fn push(&mut self, plaintext: &[u8], tag: ChunkTag) -> Result<Vec<u8>> {
        let nonce = derive_nonce(&self.header, self.counter);
        let aad = self.counter.to_be_bytes();

        let mut message = Vec::with_capacity(plaintext.len() + 1);
        message.push(tag as u8);
        message.extend_from_slice(plaintext);

        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &message,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Encryption("AEAD seal failed".to_string()))?;

        self.counter += 1;
        Ok(ciphertext)
    }
}

/// Decryption side of the stream
pub struct PullStream {
    cipher: XChaCha20Poly1305,
    header: StreamHeader,
    counter: u64,
}

impl PullStream {
    /// Initialize a pull stream from the header emitted by the encryptor
    pub fn init(header: &StreamHeader, key: &TransferKey) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
            header: header.clone(),
            counter: 0,
        }
    }

    /// Save the current cipher position
    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            counter: self.counter,
        }
    }

    /// Roll back to a previously saved position
    pub fn restore(&mut self, snapshot: StreamSnapshot) {
        self.counter = snapshot.counter;
    }

    /// Index of the next chunk to be decrypted
    pub fn chunk_index(&self) -> u64 {
        self.counter
    }

    /// Decrypt the next chunk in sequence
    ///
    /// Fails with [`CryptoError::Authentication`] when the chunk does not
    /// verify; the stream must then be abandoned, no further chunks may be
    /// pulled.
    pub fn pull(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, ChunkTag)> {
        if ciphertext.len() < STREAM_OVERHEAD {
            return Err(CryptoError::InvalidCiphertext(format!(
                "chunk of {} bytes is below the minimum of {}",
                ciphertext.len(),
                STREAM_OVERHEAD
            )));
        }

        let nonce = derive_nonce(&self.header, self.counter);
        let aad = self.counter.to_be_bytes();

        let mut message = self
            .cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Authentication)?;

        let plaintext = message.split_off(1);
        let tag = ChunkTag::from_byte(message[0])?;

        self.counter += 1;
        Ok((plaintext, tag))
    }
}

/// Derive the per-chunk nonce: the header with the big-endian chunk counter
/// folded into its trailing eight bytes.
fn derive_nonce(header: &StreamHeader, counter: u64) -> XNonce {
    let mut nonce = *header.as_bytes();
    let idx = counter.to_be_bytes();
    for i in 0..8 {
        nonce[16 + i] ^= idx[i];
    }
    XNonce::from(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TransferKey {
        TransferKey::generate()
    }

    #[test]
    fn test_roundtrip_multiple_chunks() {
        let key = key();
        let (mut push, header) = PushStream::init(&key);

        let chunks: Vec<&[u8]> = vec![b"first chunk", b"second chunk", b"last"];
        let mut wire = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let tag = if i == chunks.len() - 1 {
                ChunkTag::Final
            } else {
                ChunkTag::Message
            };
            wire.push(push.push(chunk, tag).unwrap());
        }

        let mut pull = PullStream::init(&header, &key);
        for (i, ct) in wire.iter().enumerate() {
            let (plaintext, tag) = pull.pull(ct).unwrap();
            assert_eq!(plaintext.as_slice(), chunks[i]);
            assert_eq!(tag.is_final(), i == chunks.len() - 1);
        }
    }

    #[test]
    fn test_overhead_is_constant() {
        let key = key();
        let (mut push, _) = PushStream::init(&key);
        for len in [0usize, 1, 28, 1024] {
            let ct = push.push(&vec![0u8; len], ChunkTag::Message).unwrap();
            assert_eq!(ct.len(), len + STREAM_OVERHEAD);
        }
    }

    #[test]
    fn test_restore_reencrypts_identically() {
        let key = key();
        let (mut push, _) = PushStream::init(&key);
        push.push(b"committed", ChunkTag::Message).unwrap();

        let snapshot = push.snapshot();
        let first_attempt = push.push(b"unacked chunk", ChunkTag::Message).unwrap();

        // The send was never acknowledged: roll back and retry.
        push.restore(snapshot);
        let second_attempt = push.push(b"unacked chunk", ChunkTag::Message).unwrap();

        assert_eq!(first_attempt, second_attempt);
    }

    #[test]
    fn test_tampered_chunk_fails_authentication() {
        let key = key();
        let (mut push, header) = PushStream::init(&key);
        let mut ct = push.push(b"some data", ChunkTag::Final).unwrap();
        ct[3] ^= 0x01;

        let mut pull = PullStream::init(&header, &key);
        assert!(matches!(
            pull.pull(&ct),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn test_out_of_order_chunk_fails() {
        let key = key();
        let (mut push, header) = PushStream::init(&key);
        let first = push.push(b"one", ChunkTag::Message).unwrap();
        let second = push.push(b"two", ChunkTag::Final).unwrap();

        let mut pull = PullStream::init(&header, &key);
        // Skipping the first chunk desynchronizes the counter.
        assert!(pull.pull(&second).is_err());
        // A fresh pull in order still works.
        let mut pull = PullStream::init(&header, &key);
        pull.pull(&first).unwrap();
        pull.pull(&second).unwrap();
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = key();
        let (mut push, header) = PushStream::init(&key);
        let ct = push.push(b"data", ChunkTag::Final).unwrap();

        let mut pull = PullStream::init(&header, &TransferKey::generate());
        assert!(matches!(pull.pull(&ct), Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_resume_at_matches_uninterrupted_stream() {
        let key = key();
        let (mut push, header) = PushStream::init(&key);
        let _first = push.push(b"chunk zero", ChunkTag::Message).unwrap();
        let expected = push.push(b"chunk one", ChunkTag::Final).unwrap();

        // A restarted sender resumes at the committed chunk boundary.
        let mut resumed = PushStream::resume_at(&key, &header, 1);
        let actual = resumed.push(b"chunk one", ChunkTag::Final).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_empty_final_chunk() {
        let key = key();
        let (mut push, header) = PushStream::init(&key);
        let ct = push.push(b"", ChunkTag::Final).unwrap();
        assert_eq!(ct.len(), STREAM_OVERHEAD);

        let mut pull = PullStream::init(&header, &key);
        let (plaintext, tag) = pull.pull(&ct).unwrap();
        assert!(plaintext.is_empty());
        assert!(tag.is_final());
    }

    #[test]
    fn test_short_chunk_rejected_without_state_advance() {
        let key = key();
        let (mut push, header) = PushStream::init(&key);
        let ct = push.push(b"payload", ChunkTag::Final).unwrap();

        let mut pull = PullStream::init(&header, &key);
        assert!(pull.pull(&ct[..STREAM_OVERHEAD - 1]).is_err());
        // The failed call must not have consumed a counter position.
        let (plaintext, _) = pull.pull(&ct).unwrap();
        assert_eq!(plaintext, b"payload");
    }
}
