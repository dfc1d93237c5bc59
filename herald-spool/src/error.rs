//! Error types for the herald-spool crate.

use std::{io, path::PathBuf};

use herald_common::MessageParseError;
use thiserror::Error;

use crate::QueueToken;

/// Top-level queue error type.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// I/O operation failed (file read/write/rename/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Metadata could not be written or read back.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// The message half of an entry is not a parseable message.
    #[error("Unparseable message {token}: {source}")]
    Message {
        token: QueueToken,
        #[source]
        source: MessageParseError,
    },

    /// The queue path exists but is not a directory.
    #[error("Expected {0} to be a directory, but it is not")]
    NotADirectory(PathBuf),

    /// A slice index outside `0..slices`.
    #[error("Invalid slice {slice} of {slices}")]
    InvalidSlice { slice: u32, slices: u32 },
}

/// Metadata encoding errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Failed to encode metadata: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode metadata for {token}: {source}")]
    Decode {
        token: QueueToken,
        #[source]
        source: serde_json::Error,
    },
}

/// Specialized `Result` type for queue operations.
pub type Result<T> = std::result::Result<T, SpoolError>;
