//! Conflict-free Replicated Data Types (CRDTs).
//!
//! Every model here can be modified independently on many replicas and
//! later reconciled without coordination. Causality is tracked with
//! per-actor [`VersionMap`]s; no wall clock is ever consulted.
//!
//! # Core Types
//!
//! - [`VersionMap`] - per-actor vector clock
//! - [`CrdtSet`] - observed-remove set without tombstones
//! - [`CrdtSingleton`] - a single mutable value built on [`CrdtSet`]
//! - [`CrdtCount`] - grow-only counter
//! - [`CrdtEntity`] - record of named singleton and collection fields
//!
//! # Traits
//!
//! - [`CrdtModel`] - merge and operation semantics shared by every model
//! - [`CrdtData`] / [`CrdtOperation`] - snapshots and causally stamped changes
//! - [`Referencable`] - values with a stable id, storable in collections

pub mod count;
pub mod entity;
pub mod errors;
pub mod referencable;
pub mod set;
pub mod singleton;
pub mod traits;
pub mod version_map;

pub use count::{CountData, CountOperation, CrdtCount};
pub use entity::{
    CrdtEntity, EntityData, EntityOperation, FieldName, RawEntity, UNINITIALIZED_TIMESTAMP,
};
pub use errors::CRDTError;
pub use referencable::{Primitive, Referencable, ReferenceId};
pub use set::{CrdtSet, DataValue, SetData, SetOperation};
pub use singleton::{CrdtSingleton, SingletonData, SingletonOperation};
pub use traits::{CrdtChange, CrdtData, CrdtModel, CrdtOperation, MergeChanges};
pub use version_map::{Actor, VersionMap};
