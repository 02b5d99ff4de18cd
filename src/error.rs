//! Error types for the tiered cache

use thiserror::Error;

use crate::cache::TierKind;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered cache
#[derive(Error, Debug)]
pub enum Error {
    /// A File or External tier could not serve the request.
    ///
    /// Degraded, never fatal: the facade logs it and falls through.
    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable { tier: TierKind, reason: String },

    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Memory tier cannot make room for the entry
    #[error("Entry {key} of {size} bytes exceeds memory budget of {budget} bytes")]
    CapacityExceeded { key: String, size: u64, budget: u64 },

    /// Malformed invalidation pattern
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// TTL of zero would create an entry that is born expired
    #[error("TTL for key {key} must be greater than zero")]
    InvalidTtl { key: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registration or encoding error
    #[error("Metrics error: {0}")]
    Metrics(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

impl Error {
    /// Shorthand for a degraded-tier error
    pub fn tier(tier: TierKind, reason: impl std::fmt::Display) -> Self {
        Error::TierUnavailable {
            tier,
            reason: reason.to_string(),
        }
    }

    /// True for errors that are programming mistakes and must reach the caller
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. }
                | Error::InvalidPattern { .. }
                | Error::InvalidTtl { .. }
                | Error::Config(_)
        )
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Metrics(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
