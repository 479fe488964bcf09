//! CRDT integration tests
//!
//! Convergence properties that every model must satisfy, plus the
//! cross-replica scenarios the models are built for.

mod convergence;
pub mod helpers;
