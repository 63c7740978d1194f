//! Error classification shared by pub/sub backends.

use std::fmt;

/// Error categories tell callers whether retrying can help.
///
/// Backends never retry on their own; the category is a hint for the
/// caller's retry wrapper.
///
/// # Categories
///
/// - **Transient**: broker or network trouble, retrying may succeed
/// - **Permanent**: invalid configuration or data, retrying won't help
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure (timeout, broker unavailable, stream creation race)
    Transient,

    /// Permanent failure (missing codec, malformed message, closed publisher)
    Permanent,
}

impl ErrorCategory {
    /// Check if an operation failing with this category may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}
