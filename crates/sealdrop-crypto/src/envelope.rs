//! Encrypted filename envelope
//!
//! The file name is sealed with a one-shot XChaCha20-Poly1305 call (not the
//! streaming construct), keyed by the same transfer key and the public nonce
//! from the share reference. The result is padded into a fixed 512-byte block
//! that is always prepended to the first ciphertext chunk, so the name leaks
//! neither content nor length to the server.
//!
//! Block layout: a 2-byte big-endian ciphertext length, the ciphertext, then
//! zero padding up to [`ENVELOPE_SIZE`].

use crate::{
    keys::{Nonce, TransferKey},
    CryptoError, Result,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};

/// Fixed size of the envelope block in bytes
pub const ENVELOPE_SIZE: usize = 512;

const LEN_PREFIX: usize = 2;
const MAC_SIZE: usize = 16;

/// Longest filename (in UTF-8 bytes) that fits in the envelope
pub const MAX_FILENAME_LEN: usize = ENVELOPE_SIZE - LEN_PREFIX - MAC_SIZE;

/// Seal a filename into a fixed 512-byte envelope block
pub fn seal_filename(name: &str, key: &TransferKey, nonce: &Nonce) -> Result<[u8; ENVELOPE_SIZE]> {
    if name.len() > MAX_FILENAME_LEN {
        return Err(CryptoError::FilenameTooLong {
            len: name.len(),
            max: MAX_FILENAME_LEN,
        });
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(nonce.as_bytes()), name.as_bytes())
        .map_err(|_| CryptoError::Encryption("filename seal failed".to_string()))?;

    let mut block = [0u8; ENVELOPE_SIZE];
    block[..LEN_PREFIX].copy_from_slice(&(ciphertext.len() as u16).to_be_bytes());
    block[LEN_PREFIX..LEN_PREFIX + ciphertext.len()].copy_from_slice(&ciphertext);
    Ok(block)
}

/// Open a filename envelope block
///
/// Fails with [`CryptoError::Authentication`] if the ciphertext does not
/// verify under the given key and nonce.
pub fn open_filename(block: &[u8], key: &TransferKey, nonce: &Nonce) -> Result<String> {
    if block.len() != ENVELOPE_SIZE {
        return Err(CryptoError::InvalidEnvelope(format!(
            "envelope must be {} bytes, got {}",
            ENVELOPE_SIZE,
            block.len()
        )));
    }

    let len = u16::from_be_bytes([block[0], block[1]]) as usize;
    if len < MAC_SIZE || len > ENVELOPE_SIZE - LEN_PREFIX {
        return Err(CryptoError::InvalidEnvelope(format!(
            "implausible ciphertext length {}",
            len
        )));
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce.as_bytes()),
            &block[LEN_PREFIX..LEN_PREFIX + len],
        )
        .map_err(|_| CryptoError::Authentication)?;

    Ok(String::from_utf8(plaintext)?)
}
