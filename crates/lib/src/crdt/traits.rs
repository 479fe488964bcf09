//! Core traits for CRDT models.
//!
//! This module defines the pieces every model in the crate shares:
//! - [`CrdtData`]: the serializable state snapshot of a model
//! - [`CrdtOperation`]: a single causally-stamped change
//! - [`CrdtModel`]: the model itself, with merge and operation semantics
//! - [`CrdtChange`] and [`MergeChanges`]: the deltas a merge produces

use std::fmt::Debug;

use serde::{Serialize, de::DeserializeOwned};

use crate::Result;
use crate::crdt::VersionMap;

/// Marker trait for CRDT state snapshots.
///
/// Data values are plain owned values. Handing one out always hands out a
/// copy, so no two components ever share a snapshot for mutation.
pub trait CrdtData:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The version map covering everything this snapshot has observed.
    fn version_map(&self) -> &VersionMap;
}

/// An operation stamped with the version map it was made at.
pub trait CrdtOperation:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn clock(&self) -> &VersionMap;
}

/// A change record: either a list of operations or a full snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum CrdtChange<D, O> {
    Operations(Vec<O>),
    Data(D),
}

impl<D, O> CrdtChange<D, O> {
    /// An empty operations list.
    pub fn empty() -> Self {
        CrdtChange::Operations(Vec::new())
    }

    /// True only for an empty operations list. A data change is never empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, CrdtChange::Operations(ops) if ops.is_empty())
    }

    pub fn is_data(&self) -> bool {
        matches!(self, CrdtChange::Data(_))
    }
}

/// The two deltas produced by a merge.
///
/// `model_change` describes how the local model changed; `other_change`
/// describes what the other side must apply to catch up with the result.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeChanges<D, O> {
    pub model_change: CrdtChange<D, O>,
    pub other_change: CrdtChange<D, O>,
}

impl<D, O> MergeChanges<D, O> {
    pub fn empty() -> Self {
        Self {
            model_change: CrdtChange::empty(),
            other_change: CrdtChange::empty(),
        }
    }

    /// Neither side needs to do anything.
    pub fn is_empty(&self) -> bool {
        self.model_change.is_empty() && self.other_change.is_empty()
    }
}

/// A Conflict-free Replicated Data Type.
///
/// Models own their data and only change through [`merge`](CrdtModel::merge),
/// [`apply_operation`](CrdtModel::apply_operation) or
/// [`update_data`](CrdtModel::update_data). Getters return copies.
///
/// `merge` must be all-or-nothing: when it returns an error the model is left
/// exactly as it was.
pub trait CrdtModel: Clone + Debug + Default + Send + Sync + 'static {
    type Data: CrdtData;
    type Operation: CrdtOperation;
    type ConsumerView;

    /// Build a model from an existing snapshot.
    fn from_data(data: Self::Data) -> Self;

    /// Copy of the current snapshot.
    fn data(&self) -> Self::Data;

    /// Copy of the current version map.
    fn version_map(&self) -> VersionMap;

    /// The application-facing projection of the data.
    fn consumer_view(&self) -> Self::ConsumerView;

    /// Merge another replica's snapshot into this model.
    fn merge(&mut self, other: Self::Data) -> Result<MergeChanges<Self::Data, Self::Operation>>;

    /// Apply a single operation.
    ///
    /// Returns `Ok(false)` when the operation is rejected, e.g. because it is
    /// not the next version for its actor. The model is unchanged in that case.
    fn apply_operation(&mut self, op: &Self::Operation) -> Result<bool>;

    /// Replace the snapshot wholesale.
    fn update_data(&mut self, data: Self::Data);
}
