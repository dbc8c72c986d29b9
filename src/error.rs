//! Error and Result types for store operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid magic bytes in a WAL segment header.
    #[error("invalid magic bytes: expected CWAL, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported WAL segment format version.
    #[error("unsupported WAL version: {0}")]
    UnsupportedVersion(u16),

    /// Record checksum does not match the stored value.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Requested summary or landmark window is not persisted.
    #[error("window {window_id} not found for stream {stream_id}")]
    WindowNotFound {
        /// Stream the lookup ran against.
        stream_id: i64,
        /// Window id (its start timestamp) that was requested.
        window_id: i64,
    },

    /// No WAL entry exists at the requested index.
    #[error("no WAL entry at index {0}")]
    WalEntryNotFound(u64),

    /// Stream id is not present in the database catalogue.
    #[error("stream {0} not found")]
    StreamNotFound(i64),

    /// A serialized record fails schema validation.
    #[error("corrupt record: {0}")]
    Corrupt(&'static str),

    /// An operation was invoked in a state that does not admit it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The configured windowing cannot cover the requested span.
    #[error("windowing cannot cover a span of {0} elements")]
    Conflict(i64),

    /// An operator name not in the registry was requested.
    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    /// Underlying I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Underlying LMDB error.
    #[error("lmdb error: {0}")]
    Lmdb(#[from] heed::Error),
}
