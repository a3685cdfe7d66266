//! Error types for the sealdrop-crypto crate

use thiserror::Error;

/// Result type alias using `CryptoError`
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Chunk tag verification failed. Fatal for the stream: once a chunk
    /// fails authentication no further plaintext may be produced from it.
    #[error("authentication failed: chunk did not verify")]
    Authentication,

    /// Encryption failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Invalid key format or length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid nonce format or length
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    /// Invalid stream header
    #[error("invalid stream header: {0}")]
    InvalidHeader(String),

    /// Ciphertext chunk is malformed (too short, unknown tag byte)
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    /// Filename envelope is malformed
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Filename exceeds what fits in the fixed-size envelope
    #[error("filename too long: {len} bytes exceeds maximum {max} bytes")]
    FilenameTooLong { len: usize, max: usize },

    /// Share reference could not be parsed
    #[error("invalid share reference: {0}")]
    InvalidShareReference(String),

    /// Base64 decode error
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    /// Decrypted filename is not valid UTF-8
    #[error("filename is not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}
