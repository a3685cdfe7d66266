//! # Sealdrop Crypto
//!
//! Cryptographic primitives for the sealdrop end-to-end encrypted file
//! transfer system.
//!
//! This crate provides:
//! - **Streaming AEAD**: a stateful push/pull construct over
//!   XChaCha20-Poly1305 that processes a file as an ordered sequence of
//!   chunks, with a distinct terminal tag marking end-of-stream
//! - **Filename envelopes**: one-shot authenticated encryption of the file
//!   name into a fixed 512-byte block that travels ahead of the ciphertext
//! - **Chunk assembly**: reconciling arbitrary read sizes into
//!   encryption-aligned chunks
//! - **Share references**: the key/header/nonce triple encoded for an
//!   out-of-band channel (URL fragment), never sent to the server
//!
//! ## Security Model
//!
//! All encryption happens client-side. The transfer key is generated on the
//! sending device and carried only inside the share reference; storage servers
//! see nothing but opaque ciphertext.

pub mod assembler;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod share;
pub mod stream;

pub use assembler::ChunkAssembler;
pub use envelope::{open_filename, seal_filename, ENVELOPE_SIZE, MAX_FILENAME_LEN};
pub use error::{CryptoError, Result};
pub use keys::{Nonce, TransferKey, KEY_SIZE, NONCE_SIZE};
pub use share::ShareReference;
pub use stream::{ChunkTag, PullStream, PushStream, StreamHeader, StreamSnapshot, HEADER_SIZE, STREAM_OVERHEAD};

/// Default plaintext chunk size for streaming encryption (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
