//! Error types for priority parsing.

use thiserror::Error;

/// Errors that can occur when decoding a syslog priority.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PriorityError {
    /// The `<N>` prefix did not contain a decimal number
    #[error("Invalid priority prefix: {0}")]
    InvalidPrefix(String),

    /// Severity must fit in three bits
    #[error("Severity out of range: {0} (expected 0-7)")]
    SeverityOutOfRange(u8),
}
