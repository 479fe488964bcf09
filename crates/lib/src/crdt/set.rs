//! An observed-remove set without tombstones.
//!
//! [`CrdtSet`] follows the optimized OR-Set of Bieniusa et al. (2012): every
//! element carries the version map it was added at, and the set as a whole
//! carries the version map of everything it has observed. An element missing
//! from a set whose version map dominates the element's version was removed
//! there, so no explicit tombstones are kept.
//!
//! # Examples
//!
//! ```
//! use convergent::crdt::{CrdtModel, CrdtSet, Primitive, SetOperation, VersionMap};
//!
//! let mut set = CrdtSet::<Primitive>::new();
//! let added = set
//!     .apply_operation(&SetOperation::Add {
//!         actor: "alice".into(),
//!         clock: VersionMap::from([("alice", 1)]),
//!         added: Primitive::from("x"),
//!     })
//!     .unwrap();
//! assert!(added);
//! assert_eq!(set.consumer_view(), vec![Primitive::from("x")]);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::Result;
use crate::crdt::{
    Actor, CRDTError, CrdtChange, CrdtData, CrdtModel, CrdtOperation, MergeChanges, ReferenceId,
    Referencable, VersionMap, referencable::content_hash,
};

/// A single element of a set together with the version it was added at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue<T> {
    pub version_map: VersionMap,
    pub value: T,
}

impl<T> DataValue<T> {
    pub fn new(version_map: VersionMap, value: T) -> Self {
        Self { version_map, value }
    }
}

/// State of a [`CrdtSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetData<T> {
    pub version_map: VersionMap,
    pub values: BTreeMap<ReferenceId, DataValue<T>>,
}

impl<T> Default for SetData<T> {
    fn default() -> Self {
        Self {
            version_map: VersionMap::new(),
            values: BTreeMap::new(),
        }
    }
}

impl<T: Referencable> SetData<T> {
    pub fn new(version_map: VersionMap) -> Self {
        Self {
            version_map,
            values: BTreeMap::new(),
        }
    }

    /// Insert `value` at `version_map`, keyed by its id.
    pub fn insert(&mut self, version_map: VersionMap, value: T) {
        self.values
            .insert(value.id(), DataValue::new(version_map, value));
    }
}

impl<T: Referencable> CrdtData for SetData<T> {
    fn version_map(&self) -> &VersionMap {
        &self.version_map
    }
}

/// Operations accepted by a [`CrdtSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum SetOperation<T> {
    /// `actor` adds `added`; `clock[actor]` must be the actor's next version.
    Add {
        actor: Actor,
        clock: VersionMap,
        added: T,
    },
    /// `actor` removes `removed`; `clock` must dominate the element's version.
    Remove {
        actor: Actor,
        clock: VersionMap,
        removed: T,
    },
    /// Remove every element dominated by `clock`, or everything when `clock` is empty.
    Clear { actor: Actor, clock: VersionMap },
    /// Batch catch-up from `old_clock` to `new_clock`.
    FastForward {
        old_clock: VersionMap,
        new_clock: VersionMap,
        added: Vec<DataValue<T>>,
        removed: Vec<T>,
    },
}

impl<T: Referencable> CrdtOperation for SetOperation<T> {
    fn clock(&self) -> &VersionMap {
        match self {
            SetOperation::Add { clock, .. }
            | SetOperation::Remove { clock, .. }
            | SetOperation::Clear { clock, .. } => clock,
            SetOperation::FastForward { new_clock, .. } => new_clock,
        }
    }
}

impl<T: Referencable> SetOperation<T> {
    /// Apply this operation to `data`.
    ///
    /// With `dry_run` set, only reports whether the operation would succeed.
    /// A FastForward may fail partway with a divergence error, so callers
    /// that need atomicity apply it to a copy.
    fn apply_to(&self, data: &mut SetData<T>, dry_run: bool) -> Result<bool> {
        match self {
            SetOperation::Add {
                actor,
                clock,
                added,
            } => {
                // Only accept an add that is the actor's next version.
                if clock.get(actor) != data.version_map.get(actor) + 1 {
                    return Ok(false);
                }
                if dry_run {
                    return Ok(true);
                }
                data.version_map.set(actor.as_str(), clock.get(actor));
                let id = added.id();
                let version_map = match data.values.get(&id) {
                    Some(previous) => clock.merge_with(&previous.version_map),
                    None => clock.clone(),
                };
                data.values
                    .insert(id, DataValue::new(version_map, added.clone()));
                Ok(true)
            }
            SetOperation::Remove {
                actor,
                clock,
                removed,
            } => {
                let id = removed.id();
                let Some(existing) = data.values.get(&id) else {
                    return Ok(false);
                };
                // Removes never advance the actor's version.
                if clock.get(actor) != data.version_map.get(actor) {
                    return Ok(false);
                }
                if !clock.dominates(&existing.version_map) {
                    return Ok(false);
                }
                if !dry_run {
                    data.values.remove(&id);
                }
                Ok(true)
            }
            SetOperation::Clear { actor, clock } => {
                if clock.is_empty() {
                    if !dry_run {
                        data.values.clear();
                    }
                    return Ok(true);
                }
                if clock.get(actor) != data.version_map.get(actor) {
                    return Ok(false);
                }
                if !dry_run {
                    data.values
                        .retain(|_, item| !clock.dominates(&item.version_map));
                }
                Ok(true)
            }
            SetOperation::FastForward {
                old_clock,
                new_clock,
                added,
                removed,
            } => {
                if !data.version_map.dominates(old_clock) {
                    return Ok(false);
                }
                // Already knows about everything in the batch.
                if data.version_map.dominates(new_clock) {
                    return Ok(true);
                }
                if dry_run {
                    return Ok(true);
                }
                for item in added {
                    let id = item.value.id();
                    match data.values.get(&id) {
                        Some(existing) => {
                            let resolved = resolve(existing, item)?;
                            data.values.insert(id, resolved);
                        }
                        None if !data.version_map.dominates(&item.version_map) => {
                            data.values.insert(id, item.clone());
                        }
                        None => {}
                    }
                }
                for value in removed {
                    let id = value.id();
                    let dominated = data
                        .values
                        .get(&id)
                        .is_some_and(|existing| new_clock.dominates(&existing.version_map));
                    if dominated {
                        data.values.remove(&id);
                    }
                }
                data.version_map.merge(new_clock);
                Ok(true)
            }
        }
    }

    /// Reduce a FastForward to plain operations where possible.
    ///
    /// Only a batch of additions made by a single actor at consecutive
    /// versions can be replayed as individual `Add`s. Anything else is
    /// returned unchanged, and non-FastForward operations pass through.
    pub fn simplify(self) -> Vec<SetOperation<T>> {
        let SetOperation::FastForward {
            old_clock,
            new_clock,
            added,
            removed,
        } = &self
        else {
            return vec![self];
        };

        // Remove ops can't be replayed in order.
        if !removed.is_empty() {
            return vec![self];
        }
        if added.is_empty() {
            if old_clock == new_clock {
                return Vec::new();
            }
            // Just a version bump.
            return vec![self];
        }

        let diff = new_clock.minus(old_clock);
        if diff.len() != 1 {
            return vec![self];
        }
        let Some(actor) = diff.actors().next().map(str::to_string) else {
            return vec![self];
        };

        let mut sorted = added.clone();
        sorted.sort_by_key(|item| item.version_map.get(&actor));
        let mut expected = old_clock.get(&actor);
        for item in &sorted {
            expected += 1;
            if item.version_map.get(&actor) != expected {
                return vec![self];
            }
        }
        let mut expected_clock = old_clock.clone();
        expected_clock.set(actor.as_str(), expected);
        if &expected_clock != new_clock {
            return vec![self];
        }

        sorted
            .into_iter()
            .map(|item| SetOperation::Add {
                actor: actor.clone(),
                clock: item.version_map,
                added: item.value,
            })
            .collect()
    }
}

/// Pick the surviving entry for an id both sides hold.
///
/// A dominating version keeps its value. Truly concurrent versions keep the
/// value with the lower content hash, so every replica picks the same one.
/// Equal versions carrying different values cannot be reconciled.
pub(crate) fn resolve<T: Referencable>(
    mine: &DataValue<T>,
    theirs: &DataValue<T>,
) -> Result<DataValue<T>> {
    if mine.version_map == theirs.version_map {
        if mine.value != theirs.value {
            return Err(CRDTError::DivergentVersion {
                reason: format!(
                    "id '{}' holds different values at version {}",
                    mine.value.id(),
                    mine.version_map
                ),
            }
            .into());
        }
        return Ok(mine.clone());
    }

    let version_map = mine.version_map.merge_with(&theirs.version_map);
    let value = if mine.version_map.dominates(&theirs.version_map) || mine.value == theirs.value {
        mine.value.clone()
    } else if theirs.version_map.dominates(&mine.version_map) {
        theirs.value.clone()
    } else if content_hash(&mine.value)? <= content_hash(&theirs.value)? {
        mine.value.clone()
    } else {
        theirs.value.clone()
    };
    Ok(DataValue::new(version_map, value))
}

/// Merge `other` into `data`, returning the merged snapshot and the
/// operations the other side needs. `data` itself is not modified.
pub(crate) fn merge_set_data<T: Referencable>(
    data: &SetData<T>,
    other: &SetData<T>,
) -> Result<(SetData<T>, Vec<SetOperation<T>>)> {
    let new_clock = data.version_map.merge_with(&other.version_map);
    let mut merged = SetData::new(new_clock.clone());
    let mut added = Vec::new();
    let mut removed = Vec::new();

    for (id, theirs) in &other.values {
        match data.values.get(id) {
            Some(mine) => {
                let resolved = resolve(mine, theirs)?;
                if &resolved != theirs {
                    added.push(resolved.clone());
                }
                merged.values.insert(id.clone(), resolved);
            }
            // Removed on this side.
            None if data.version_map.dominates(&theirs.version_map) => {
                removed.push(theirs.value.clone());
            }
            None => {
                merged.values.insert(id.clone(), theirs.clone());
            }
        }
    }

    for (id, mine) in &data.values {
        if !other.values.contains_key(id) && !other.version_map.dominates(&mine.version_map) {
            merged.values.insert(id.clone(), mine.clone());
            added.push(mine.clone());
        }
    }

    let other_ops = if !added.is_empty()
        || !removed.is_empty()
        || !other.version_map.dominates(&new_clock)
    {
        SetOperation::FastForward {
            old_clock: other.version_map.clone(),
            new_clock,
            added,
            removed,
        }
        .simplify()
    } else {
        Vec::new()
    };

    Ok((merged, other_ops))
}

/// Observed-remove set of [`Referencable`] values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrdtSet<T> {
    data: SetData<T>,
}

impl<T> Default for CrdtSet<T> {
    fn default() -> Self {
        Self {
            data: SetData::default(),
        }
    }
}

impl<T: Referencable> CrdtSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `op` would succeed, without applying it.
    pub fn can_apply_operation(&self, op: &SetOperation<T>) -> Result<bool> {
        let mut scratch = self.data.clone();
        op.apply_to(&mut scratch, true)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.data.values.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.data.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.values.is_empty()
    }

    /// Borrow the live entries in id order.
    pub fn entries(&self) -> impl Iterator<Item = (&ReferenceId, &DataValue<T>)> {
        self.data.values.iter()
    }

    /// Drop every element dominated by `clock` and fold `clock` into the
    /// set's version map.
    pub(crate) fn clear_dominated(&mut self, clock: &VersionMap) {
        self.data
            .values
            .retain(|_, item| !clock.dominates(&item.version_map));
        self.data.version_map.merge(clock);
    }
}

impl<T: Referencable> CrdtModel for CrdtSet<T> {
    type Data = SetData<T>;
    type Operation = SetOperation<T>;
    /// Live values in id order.
    type ConsumerView = Vec<T>;

    fn from_data(data: SetData<T>) -> Self {
        Self { data }
    }

    fn data(&self) -> SetData<T> {
        self.data.clone()
    }

    fn version_map(&self) -> VersionMap {
        self.data.version_map.clone()
    }

    fn consumer_view(&self) -> Vec<T> {
        self.data
            .values
            .values()
            .map(|item| item.value.clone())
            .collect()
    }

    fn merge(&mut self, other: SetData<T>) -> Result<MergeChanges<SetData<T>, SetOperation<T>>> {
        let (merged, other_ops) = merge_set_data(&self.data, &other)?;

        let model_change = if merged == self.data {
            CrdtChange::empty()
        } else {
            CrdtChange::Data(merged.clone())
        };
        trace!(
            version = %merged.version_map,
            other_ops = other_ops.len(),
            "merged set data"
        );
        self.data = merged;

        Ok(MergeChanges {
            model_change,
            other_change: CrdtChange::Operations(other_ops),
        })
    }

    fn apply_operation(&mut self, op: &SetOperation<T>) -> Result<bool> {
        if matches!(op, SetOperation::FastForward { .. }) {
            let mut next = self.data.clone();
            let applied = op.apply_to(&mut next, false)?;
            if applied {
                self.data = next;
            }
            return Ok(applied);
        }
        op.apply_to(&mut self.data, false)
    }

    fn update_data(&mut self, data: SetData<T>) {
        self.data = data;
    }
}
