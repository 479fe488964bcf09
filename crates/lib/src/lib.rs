//!
//! Convergent: replicated application state that reconciles without coordination.
//!
//! ## Core Concepts
//!
//! * **CRDTs (`crdt`)**: Conflict-free Replicated Data Types. Every model carries
//!   a per-actor vector clock ([`crdt::VersionMap`]) and merges deterministically:
//!     * **CrdtSet (`crdt::CrdtSet`)**: an observed-remove set without tombstones.
//!     * **CrdtSingleton (`crdt::CrdtSingleton`)**: one mutable value stored in a set.
//!     * **CrdtCount (`crdt::CrdtCount`)**: a grow-only counter.
//!     * **CrdtEntity (`crdt::CrdtEntity`)**: a record of named singleton and collection fields.
//! * **Stores (`store`)**: keep a CRDT model synchronized with a persistence driver
//!   and with any number of client proxies:
//!     * **DirectStore (`store::DirectStore`)**: one model, one driver, an explicit send/acknowledge state machine.
//!     * **BackingStore (`store::BackingStore`)**: many independently versioned records under one location.
//!     * **ReferenceModeStore (`store::ReferenceModeStore`)**: a collection of references backed by full records.

pub mod crdt;
pub mod store;

/// Result type used throughout the Convergent library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the Convergent library.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Structured CRDT errors from the crdt module
    #[error(transparent)]
    CRDT(crdt::CRDTError),

    /// Structured store errors from the store module
    #[error(transparent)]
    Store(store::StoreError),
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::CRDT(_) => "crdt",
            Error::Store(_) => "store",
            Error::Serialize(_) => "serialize",
        }
    }

    /// Check if this error is CRDT-related.
    pub fn is_crdt_error(&self) -> bool {
        matches!(self, Error::CRDT(_))
    }

    /// Check if this error reports replicas that can never converge.
    pub fn is_crdt_divergence(&self) -> bool {
        match self {
            Error::CRDT(crdt_err) => crdt_err.is_divergence(),
            _ => false,
        }
    }

    /// Check if this error is store-related.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Error::Store(_))
    }

    /// Check if this error is a configuration problem caught at construction.
    pub fn is_configuration_error(&self) -> bool {
        match self {
            Error::Store(store_err) => store_err.is_configuration_error(),
            _ => false,
        }
    }

    /// Check if this error is serialization-related.
    pub fn is_serialization_error(&self) -> bool {
        match self {
            Error::Serialize(_) => true,
            Error::CRDT(crdt_err) => crdt_err.is_serialization_error(),
            Error::Store(store_err) => store_err.is_serialization_error(),
        }
    }
}
