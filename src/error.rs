//! Error types for the model acquisition pipeline.

/// Top-level error type for model download, verification, and cache
/// management.
///
/// Callers are expected to match on the variant, not the message text.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Unnormalizable or empty repository identifier, or a manifest that
    /// filters down to zero downloadable files.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The repository is in backoff; no network attempt was made.
    #[error("network unavailable; retry in {retry_in_seconds}s")]
    NetworkUnavailable {
        /// Seconds until the repository becomes eligible again.
        retry_in_seconds: u64,
    },

    /// Timeout, 5xx, DNS/socket failure, or mid-stream disconnect.
    /// Eligible for backoff.
    #[error("transient network error: {0}")]
    Transient(String),

    /// Repository or file absent on the hub. Not backoff-eligible.
    #[error("not found: {0}")]
    NotFound(String),

    /// 401/403 from the hub. Not backoff-eligible.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Size or hash mismatch detected after download.
    #[error("integrity failure for {file}: {reason}")]
    IntegrityFailure {
        /// Relative path of the offending file.
        file: String,
        /// Human-readable mismatch description.
        reason: String,
    },

    /// Local filesystem problem (ENOSPC, EACCES, failed move).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cooperative cancellation.
    #[error("download cancelled")]
    Cancelled,

    /// A download for the same repository is already in flight.
    #[error("download already in progress for {0}")]
    Busy(String),
}

impl FetchError {
    /// Whether this error should count against a repository's network
    /// backoff state.
    ///
    /// True for transient failures and for any error whose message reads
    /// like a connectivity problem. Not-found, auth, integrity, and local
    /// I/O errors never trigger backoff.
    #[must_use]
    pub fn is_network_related(&self) -> bool {
        match self {
            Self::Transient(_) | Self::NetworkUnavailable { .. } => true,
            Self::NotFound(_)
            | Self::PermissionDenied(_)
            | Self::IntegrityFailure { .. }
            | Self::InvalidInput(_)
            | Self::Cancelled
            | Self::Busy(_) => false,
            Self::Io(e) => {
                let msg = e.to_string().to_lowercase();
                ["network", "internet", "offline", "timed out", "connection"]
                    .iter()
                    .any(|needle| msg.contains(needle))
            }
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, FetchError>;
