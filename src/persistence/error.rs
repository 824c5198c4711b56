//! Persistence error types.

use std::fmt;

/// Errors returned by storage backends and snapshot decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Write attempted after the backend was closed
    Closed,
    /// A stored record holds a value outside the range of its field
    Corruption { field: &'static str, value: u8 },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "storage backend closed"),
            Self::Corruption { field, value } => {
                write!(f, "data corruption: invalid {} {}", field, value)
            }
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;
