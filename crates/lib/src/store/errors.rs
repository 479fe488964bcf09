//! Error types for store operations.
//!
//! Driver rejections are not errors: they drive the state machine back to
//! waiting for the driver's model. These variants cover misconfiguration,
//! malformed messages and workers that are no longer running.

use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage key, mode and model type do not fit together
    #[error("Invalid store configuration for '{key}': {reason}")]
    InvalidConfiguration { key: String, reason: String },

    /// A proxy message the store cannot interpret
    #[error("Unsupported message for store '{key}': {reason}")]
    UnsupportedMessage { key: String, reason: String },

    /// No driver could be provided for a storage key
    #[error("No driver available for '{key}': {reason}")]
    DriverUnavailable { key: String, reason: String },

    /// The store's background worker has shut down
    #[error("Store worker for '{key}' has stopped")]
    WorkerStopped { key: String },

    /// A write to the backing store did not complete
    #[error("Backing store write failed for record '{id}': {reason}")]
    BackingWriteFailed { id: String, reason: String },

    /// Driver data could not be encoded or decoded
    #[error("Serialization failed for store '{key}': {reason}")]
    Serialization { key: String, reason: String },
}

impl StoreError {
    /// Check if this error was raised while constructing a store
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, StoreError::InvalidConfiguration { .. })
    }

    /// Check if this error rejected a proxy message
    pub fn is_unsupported_message(&self) -> bool {
        matches!(self, StoreError::UnsupportedMessage { .. })
    }

    /// Check if this error is related to the driver layer
    pub fn is_driver_error(&self) -> bool {
        matches!(self, StoreError::DriverUnavailable { .. })
    }

    /// Check if this error means the store can no longer be used
    pub fn is_stopped(&self) -> bool {
        matches!(self, StoreError::WorkerStopped { .. })
    }

    /// Check if this error is related to serialization
    pub fn is_serialization_error(&self) -> bool {
        matches!(self, StoreError::Serialization { .. })
    }

    /// Get the storage key if this error carries one
    pub fn key(&self) -> Option<&str> {
        match self {
            StoreError::InvalidConfiguration { key, .. }
            | StoreError::UnsupportedMessage { key, .. }
            | StoreError::DriverUnavailable { key, .. }
            | StoreError::WorkerStopped { key }
            | StoreError::Serialization { key, .. } => Some(key),
            StoreError::BackingWriteFailed { .. } => None,
        }
    }
}

// Conversion from StoreError to the main Error type
impl From<StoreError> for crate::Error {
    fn from(err: StoreError) -> Self {
        crate::Error::Store(err)
    }
}
