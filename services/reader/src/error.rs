//! Error types shared by the record codec and the log sources.

use thiserror::Error;

/// Message prefix of the paginator fault raised when the service hands back
/// the same continuation token twice in a row.
pub const DUPLICATE_NEXT_TOKEN_MESSAGE: &str = "The same next token was received twice";

/// A fault reported by an external collaborator (log service paginator or
/// object store).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SourceFault {
    pub message: String,
}

impl SourceFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Whether this is the known duplicate-token paginator defect.
    ///
    /// Workaround for an external paginator quirk: only a message that starts
    /// with [`DUPLICATE_NEXT_TOKEN_MESSAGE`] qualifies. Nothing else is ever
    /// treated as end-of-data.
    pub fn is_duplicate_next_token(&self) -> bool {
        self.message.starts_with(DUPLICATE_NEXT_TOKEN_MESSAGE)
    }
}

/// Errors that can occur while reading flow log records
#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("Malformed flow record ({reason}): {line:?}")]
    MalformedRecord { line: String, reason: String },

    #[error("Log source fault: {0}")]
    Source(#[from] SourceFault),

    #[error("Failed to decode archive object {key}: {source}")]
    Decompress {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl ReaderError {
    pub(crate) fn malformed(line: &str, reason: impl Into<String>) -> Self {
        ReaderError::MalformedRecord {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = ReaderError> = std::result::Result<T, E>;
