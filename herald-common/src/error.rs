//! Error types for the herald-common crate.

use thiserror::Error;

/// Errors that can occur while turning raw bytes into a [`crate::Message`].
#[derive(Debug, Error)]
pub enum MessageParseError {
    /// The header block could not be parsed.
    #[error("Invalid message headers: {0}")]
    Headers(#[from] mailparse::MailParseError),

    /// A header name contains characters that cannot be written back out.
    #[error("Invalid header name: {0:?}")]
    InvalidHeaderName(String),
}
