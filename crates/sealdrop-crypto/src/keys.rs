//! Key material for a transfer
//!
//! A transfer is protected by a single symmetric key generated on the sending
//! device. The key travels only inside the share reference; the accompanying
//! public nonce is used by the one-shot filename envelope.

use crate::{CryptoError, Result};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the symmetric transfer key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the envelope nonce in bytes (192 bits, XChaCha20)
pub const NONCE_SIZE: usize = 24;

/// The symmetric key protecting one transfer
///
/// Generated at upload start, never persisted server-side.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TransferKey {
    key: [u8; KEY_SIZE],
}

impl TransferKey {
    /// Generate a new random transfer key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut key);
        Self { key }
    }

    /// Create a key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "transfer key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        write!(f, "TransferKey(..)")
    }
}

/// The public nonce for the filename envelope
///
/// Carried in the share reference alongside the key. Public, but never sent
/// to the server because the fragment stays on the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nonce {
    bytes: [u8; NONCE_SIZE],
}

impl Nonce {
    /// Generate a random nonce
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonce(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; NONCE_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the nonce bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generate_roundtrip() {
        let key = TransferKey::generate();
        let restored = TransferKey::from_bytes(key.as_bytes()).unwrap();
        assert_eq!(key.as_bytes(), restored.as_bytes());
    }

    #[test]
    fn test_key_rejects_wrong_length() {
        assert!(TransferKey::from_bytes(&[0u8; 16]).is_err());
        assert!(Nonce::from_bytes(&[0u8; 12]).is_err());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let key = TransferKey::generate();
        assert_eq!(format!("{:?}", key), "TransferKey(..)");
    }
}
