//! Transfer status reporting
//!
//! Managers report progress and terminal states through a single callback.
//! Internal retries stay invisible to the caller except as progress stalls.

/// Status callback type
pub type StatusCallback = Box<dyn Fn(TransferStatus) + Send + Sync>;

/// A point-in-time report from a transfer manager
#[derive(Clone, Debug)]
pub enum TransferStatus {
    /// Bytes committed so far
    Progress {
        /// Bytes durably committed (acknowledged by the server, or consumed
        /// by the delivery sink)
        bytes: u64,
        /// Expected total, when known
        total: Option<u64>,
    },
    /// The transfer finished successfully
    Completed,
    /// The transfer was cancelled and its session reset
    Cancelled,
    /// The transfer failed
    Failed {
        /// Human-readable cause
        message: String,
        /// Whether the session was preserved for a resume
        retryable: bool,
    },
}

impl TransferStatus {
    /// Percentage complete, when the total is known
    pub fn percentage(&self) -> Option<f64> {
        match self {
            Self::Progress {
                bytes,
                total: Some(total),
            } if *total > 0 => Some((*bytes as f64 / *total as f64) * 100.0),
            Self::Completed => Some(100.0),
            _ => None,
        }
    }
}
