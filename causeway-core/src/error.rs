//! Error types for CAUSEWAY operations

use crate::{EventId, SourceId, Timestamp};
use thiserror::Error;

/// Binary codec errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated input at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Unsupported format version {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },

    #[error("Unknown event kind tag: {0}")]
    UnknownKind(u8),

    #[error("Invalid UTF-8 in field {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("{0} trailing bytes after event")]
    TrailingBytes(usize),

    #[error("Buffer too small: needed {needed} bytes, {available} available")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Field {field} too long: {len} bytes (limit {limit})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        limit: usize,
    },

    #[error("Invalid flag bits: {0:#04x}")]
    InvalidFlags(u8),
}

/// Capture path errors. Never surfaced to producers; the ingestor turns
/// each one into a counter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Ring buffer full")]
    Full,

    #[error("Slot reservation contended after {retries} retries")]
    Contended { retries: u32 },

    #[error("Encode failed: {0}")]
    EncodeFailed(#[from] CodecError),
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Event not found: {id}")]
    NotFound { id: EventId },

    #[error("Duplicate event id {id} rejected")]
    Duplicate { id: EventId },

    #[error("Store saturated: write lock not acquired within {waited_ms}ms")]
    Saturated { waited_ms: u64 },

    #[error("Store operation {operation} timed out after {waited_ms}ms")]
    Timeout { operation: String, waited_ms: u64 },

    #[error("Index corruption in {index}: {reason}")]
    IndexCorruption { index: String, reason: String },
}

impl StorageError {
    /// Pressure errors the writer pool retries with a smaller batch.
    pub fn is_pressure(&self) -> bool {
        matches!(self, Self::Saturated { .. } | Self::Timeout { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Query errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("No {what} for source {source_id} at or before {at}")]
    NotFound {
        what: &'static str,
        source_id: SourceId,
        at: Timestamp,
    },

    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Cold archive errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("Archive unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Archive rejected {count} events: {reason}")]
    Rejected { count: usize, reason: String },
}

/// Master error type for all CAUSEWAY errors.
#[derive(Debug, Clone, Error)]
pub enum CausewayError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),
}

/// Result type alias for CAUSEWAY operations.
pub type CausewayResult<T> = Result<T, CausewayError>;

// =============================================================================
// TESTS
// =============================================================================
