//! Error types for CRDT operations.
//!
//! Rejected operations are not errors: `apply_operation` reports them as
//! `Ok(false)`. The variants here are reserved for failures that no merge or
//! resynchronization can repair.

use thiserror::Error;

/// Structured error types for CRDT operations.
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum CRDTError {
    /// Two replicas disagree in a way no merge rule resolves
    #[error("Divergent CRDT versions: {reason}")]
    DivergentVersion { reason: String },

    /// Two entities with different non-empty ids were merged
    #[error("Cannot merge entity '{ours}' with entity '{theirs}'")]
    ConflictingIds { ours: String, theirs: String },

    /// Operation addressed a field the entity does not have
    #[error("Invalid field: {field} does not exist")]
    InvalidField { field: String },

    /// Operation cannot be expressed or applied in this context
    #[error("Invalid CRDT operation: {reason}")]
    InvalidOperation { reason: String },

    /// Encoding a value for hashing or transport failed
    #[error("CRDT serialization failed: {reason}")]
    Serialization { reason: String },
}

impl CRDTError {
    /// Check if this error reports replicas that cannot converge
    pub fn is_divergence(&self) -> bool {
        matches!(
            self,
            CRDTError::DivergentVersion { .. } | CRDTError::ConflictingIds { .. }
        )
    }

    /// Check if this error is related to an unknown field
    pub fn is_invalid_field(&self) -> bool {
        matches!(self, CRDTError::InvalidField { .. })
    }

    /// Check if this error is related to an unsupported operation
    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, CRDTError::InvalidOperation { .. })
    }

    /// Check if this error is related to serialization
    pub fn is_serialization_error(&self) -> bool {
        matches!(self, CRDTError::Serialization { .. })
    }

    /// Get the field name if this is a field error
    pub fn field(&self) -> Option<&str> {
        match self {
            CRDTError::InvalidField { field } => Some(field),
            _ => None,
        }
    }
}

// Conversion from CRDTError to the main Error type
impl From<CRDTError> for crate::Error {
    fn from(err: CRDTError) -> Self {
        crate::Error::CRDT(err)
    }
}
