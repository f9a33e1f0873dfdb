//! Error types for the core library.

use thiserror::Error;

use crate::ingest::ImportError;
use crate::relay::RelayId;

/// Errors that abort a whole core operation.
///
/// Per-record problems (unparseable lines, failed validations, rejected
/// sends) are reported as data and never surface here.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The uploaded file could not be imported at all.
    #[error("Import failed: {0}")]
    Import(#[from] ImportError),

    /// A campaign was submitted but none of its relays can send.
    #[error("No usable relay: every selected relay is missing or invalid")]
    NoUsableRelay,

    /// Relay not found in the store.
    #[error("Relay not found: {0}")]
    RelayNotFound(RelayId),

    /// A campaign request is malformed.
    #[error("Invalid campaign: {0}")]
    InvalidCampaign(String),

    /// The background dispatch task died before reporting.
    #[error("Dispatch aborted: {0}")]
    Dispatch(String),

    /// A stored record could not be decoded.
    #[error("Corrupt relay record {id}: {reason}")]
    CorruptRecord {
        /// Stored identifier.
        id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
