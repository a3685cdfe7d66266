//! Share references
//!
//! All key material needed to decrypt a transfer is carried in a share
//! reference: `base64url(key).base64url(header).base64url(nonce)`. It is
//! meant to travel as a URL fragment (or an equivalent out-of-band channel),
//! which browsers never include in HTTP requests, so the server side of a
//! transfer never sees it.

use crate::{
    keys::{Nonce, TransferKey},
    stream::StreamHeader,
    CryptoError, Result,
};
use base64::Engine;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// The key/header/nonce triple enabling decryption of one transfer
#[derive(Clone)]
pub struct ShareReference {
    /// Symmetric transfer key
    pub key: TransferKey,
    /// Stream header emitted by the encryptor
    pub header: StreamHeader,
    /// Public nonce for the filename envelope
    pub nonce: Nonce,
}

impl ShareReference {
    /// Bundle the secrets of a freshly started upload
    pub fn new(key: TransferKey, header: StreamHeader, nonce: Nonce) -> Self {
        Self { key, header, nonce }
    }

    /// Encode as a fragment string: `key.header.nonce`, each base64url
    /// without padding
    pub fn encode(&self) -> String {
        format!(
            "{}.{}.{}",
            B64.encode(self.key.as_bytes()),
            B64.encode(self.header.as_bytes()),
            B64.encode(self.nonce.as_bytes()),
        )
    }

    /// Parse a fragment string produced by [`encode`](Self::encode)
    pub fn parse(fragment: &str) -> Result<Self> {
        let mut parts = fragment.split('.');
        let (key, header, nonce) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(h), Some(n), None) => (k, h, n),
            _ => {
                return Err(CryptoError::InvalidShareReference(
                    "expected three dot-separated segments".to_string(),
                ))
            }
        };

        Ok(Self {
            key: TransferKey::from_bytes(&B64.decode(key)?)?,
            header: StreamHeader::from_bytes(&B64.decode(header)?)?,
            nonce: Nonce::from_bytes(&B64.decode(nonce)?)?,
        })
    }
}

impl std::fmt::Debug for ShareReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The reference carries the transfer key; keep it out of logs.
        write!(f, "ShareReference(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::PushStream;

    #[test]
    fn test_share_reference_roundtrip() {
        let key = TransferKey::generate();
        let (_, header) = PushStream::init(&key);
        let nonce = Nonce::generate();

        let reference = ShareReference::new(key.clone(), header.clone(), nonce.clone());
        let encoded = reference.encode();

        let parsed = ShareReference::parse(&encoded).unwrap();
        assert_eq!(parsed.key.as_bytes(), key.as_bytes());
        assert_eq!(parsed.header, header);
        assert_eq!(parsed.nonce, nonce);
    }

    #[test]
    fn test_encoding_is_urlsafe_without_padding() {
        let key = TransferKey::generate();
        let (_, header) = PushStream::init(&key);
        let reference = ShareReference::new(key, header, Nonce::generate());

        let encoded = reference.encode();
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert_eq!(encoded.split('.').count(), 3);
    }

    #[test]
    fn test_parse_rejects_malformed_fragments() {
        assert!(ShareReference::parse("only.two").is_err());
        assert!(ShareReference::parse("a.b.c.d").is_err());
        assert!(ShareReference::parse("!!!.###.$$$").is_err());

        // Wrong segment lengths decode but fail validation.
        let short = format!("{}.{}.{}", "AAAA", "AAAA", "AAAA");
        assert!(ShareReference::parse(&short).is_err());
    }
}
