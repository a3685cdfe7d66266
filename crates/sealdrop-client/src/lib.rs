//! # Sealdrop Client SDK
//!
//! A client for end-to-end encrypted file transfer. Files are encrypted on
//! the sending device before any byte leaves it and decrypted on the
//! receiving device after retrieval; the server only ever stores opaque
//! ciphertext and never sees the key.
//!
//! ## Features
//!
//! - **Resumable uploads**: a continuation protocol with committed offsets;
//!   cipher state is snapshotted per chunk so retries resend identical
//!   ciphertext
//! - **Idempotent downloads**: ranged reads that resume from the committed
//!   offset with no handshake
//! - **Pluggable delivery**: decrypted plaintext reaches memory, a storage
//!   path, or a local relay hub, selected by a capability/size policy
//!
//! ## Example
//!
//! ```rust,ignore
//! use sealdrop_client::{TransferConfig, UploadManager};
//! use sealdrop_crypto::{seal_filename, Nonce, TransferKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = TransferKey::generate();
//!     let nonce = Nonce::generate();
//!     let envelope = seal_filename("notes.txt", &key, &nonce)?;
//!
//!     let mut upload = UploadManager::new(TransferConfig::new("https://drop.example"))?;
//!     upload.set_file("notes.txt", key, nonce, envelope);
//!
//!     let share = upload.share_reference().expect("file staged");
//!     let reference = upload.process().await?;
//!
//!     // Hand out: <download url>#<share fragment>. The fragment never
//!     // reaches the server.
//!     println!("{}#{}", reference.url, share.encode());
//!     Ok(())
//! }
//! ```

mod config;
mod download;
mod error;
mod progress;
mod relay;
mod sink;
mod upload;

pub use config::{RetryPolicy, TransferConfig, DEFAULT_MEMORY_SINK_MAX};
pub use download::{CancelHandle, DownloadManager, DownloadSession, DownloadState};
pub use error::{ClientError, Result};
pub use progress::{StatusCallback, TransferStatus};
pub use relay::{RelayHub, RelaySink, RelayStream, RELAY_QUEUE_DEPTH};
pub use sink::{Capabilities, Delivery, MemorySink, Sink, SinkPolicy, StorageSink};
pub use upload::{DownloadRef, UploadManager, UploadSession, UploadState};

// Re-export the crypto types a caller needs to stage or receive a transfer.
pub use sealdrop_crypto::{seal_filename, Nonce, ShareReference, StreamHeader, TransferKey};
