//! Error types for the scheduler module

use std::fmt;

use crate::store::StoreError;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// Source id not present in the rotation
    UnknownSource { id: String },

    /// Source id rejected by normalization
    InvalidSourceId { id: String, reason: String },

    /// Configuration value out of range
    InvalidConfig { field: String, reason: String },

    /// State mutated in memory but could not be written back
    Persistence { key: String, reason: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSource { id } => write!(f, "Unknown source '{}'", id),
            Self::InvalidSourceId { id, reason } => {
                write!(f, "Invalid source id '{}': {}", id, reason)
            }
            Self::InvalidConfig { field, reason } => {
                write!(f, "Invalid scheduler config '{}': {}", field, reason)
            }
            Self::Persistence { key, reason } => {
                write!(f, "Failed to persist '{}': {}", key, reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl SchedulerError {
    pub fn unknown_source(id: impl Into<String>) -> Self {
        Self::UnknownSource { id: id.into() }
    }

    pub fn invalid_source_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSourceId {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn persistence(key: impl Into<String>, err: &StoreError) -> Self {
        Self::Persistence {
            key: key.into(),
            reason: err.to_string(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}
