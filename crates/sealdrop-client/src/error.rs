//! Client error types

use serde::Deserialize;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// Network or HTTP failure; retried up to the configured attempt budget,
    /// then surfaced with session state preserved so the transfer can be
    /// resumed rather than restarted
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Unexpected status code, malformed continuation location, or a
    /// completion signal mismatch; fatal for the current attempt
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Cryptographic failure, including fatal chunk authentication failures
    #[error(transparent)]
    Crypto(#[from] sealdrop_crypto::CryptoError),

    /// A requested delivery sink is unsupported in this environment
    #[error("capability error: {0}")]
    Capability(String),

    /// Local IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid URL
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// The transfer was cancelled cooperatively
    #[error("transfer cancelled")]
    Cancelled,
}

/// JSON message body the server attaches to non-2xx responses
#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[allow(dead_code)]
    success: bool,
    message: String,
}

impl ClientError {
    /// Whether the operation may be retried against the same session
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Whether this is a fatal chunk authentication failure
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Self::Crypto(sealdrop_crypto::CryptoError::Authentication)
        )
    }

    /// Build a protocol error from an unexpected server response, pulling the
    /// human-readable message out of the JSON body when there is one
    pub async fn from_error_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiMessage>(&body)
            .map(|m| m.message)
            .unwrap_or(body);
        Self::Protocol(format!("unexpected status {}: {}", status, message))
    }
}

/// Classify an unexpected response: server errors are transport-class and
/// retryable, everything else is a protocol error carrying the server's
/// message.
pub(crate) async fn unexpected_status(response: reqwest::Response) -> ClientError {
    if response.status().is_server_error() {
        match response.error_for_status() {
            Err(err) => ClientError::Transport(err),
            Ok(_) => ClientError::Protocol("server error with a success status".to_string()),
        }
    } else {
        ClientError::from_error_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!ClientError::Protocol("bad status".to_string()).is_retryable());
        assert!(!ClientError::Cancelled.is_retryable());
        assert!(
            !ClientError::Crypto(sealdrop_crypto::CryptoError::Authentication).is_retryable()
        );
    }

    #[test]
    fn test_authentication_classification() {
        let err = ClientError::Crypto(sealdrop_crypto::CryptoError::Authentication);
        assert!(err.is_authentication());

        let err = ClientError::Crypto(sealdrop_crypto::CryptoError::InvalidCiphertext(
            "short".to_string(),
        ));
        assert!(!err.is_authentication());
    }
}
