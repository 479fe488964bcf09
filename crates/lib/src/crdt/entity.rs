//! Composite record CRDT.
//!
//! A [`CrdtEntity`] holds named singleton fields and named collection fields
//! of [`Primitive`] values, plus an id and two timestamps. Every field is its
//! own CRDT; operations are routed to the named field and merges recurse
//! field by field.
//!
//! # Examples
//!
//! ```
//! use convergent::crdt::{CrdtEntity, CrdtModel, EntityOperation, Primitive, VersionMap};
//!
//! let mut entity = CrdtEntity::with_fields("person-1", ["name"], ["tags"]);
//! entity
//!     .apply_operation(&EntityOperation::SetSingleton {
//!         actor: "alice".into(),
//!         clock: VersionMap::from([("alice", 1)]),
//!         field: "name".into(),
//!         value: Primitive::from("Ada"),
//!     })
//!     .unwrap();
//!
//! let raw = entity.consumer_view();
//! assert_eq!(raw.singletons["name"], Some(Primitive::from("Ada")));
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::Result;
use crate::crdt::{
    Actor, CRDTError, CrdtChange, CrdtData, CrdtModel, CrdtOperation, CrdtSet, CrdtSingleton,
    MergeChanges, Primitive, ReferenceId, Referencable, SetData, SetOperation, SingletonOperation,
    VersionMap,
};

/// Name of an entity field.
pub type FieldName = String;

/// Sentinel for a timestamp that has never been set.
pub const UNINITIALIZED_TIMESTAMP: i64 = -1;

/// Plain view of an entity: field values without versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntity {
    pub id: ReferenceId,
    pub singletons: BTreeMap<FieldName, Option<Primitive>>,
    pub collections: BTreeMap<FieldName, BTreeSet<Primitive>>,
    pub creation_timestamp: i64,
    pub expiration_timestamp: i64,
}

impl RawEntity {
    pub fn new(id: impl Into<ReferenceId>) -> Self {
        Self {
            id: id.into(),
            singletons: BTreeMap::new(),
            collections: BTreeMap::new(),
            creation_timestamp: UNINITIALIZED_TIMESTAMP,
            expiration_timestamp: UNINITIALIZED_TIMESTAMP,
        }
    }

    pub fn with_singleton(mut self, field: &str, value: impl Into<Primitive>) -> Self {
        self.singletons.insert(field.to_string(), Some(value.into()));
        self
    }

    pub fn with_collection<I, V>(mut self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Primitive>,
    {
        self.collections.insert(
            field.to_string(),
            values.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Names of every field, singleton fields first.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.singletons
            .keys()
            .chain(self.collections.keys())
            .map(String::as_str)
    }
}

impl Referencable for RawEntity {
    fn id(&self) -> ReferenceId {
        self.id.clone()
    }
}

/// State of a [`CrdtEntity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub version_map: VersionMap,
    pub id: ReferenceId,
    pub creation_timestamp: i64,
    pub expiration_timestamp: i64,
    pub singletons: BTreeMap<FieldName, CrdtSingleton<Primitive>>,
    pub collections: BTreeMap<FieldName, CrdtSet<Primitive>>,
}

impl Default for EntityData {
    fn default() -> Self {
        Self {
            version_map: VersionMap::new(),
            id: ReferenceId::new(),
            creation_timestamp: UNINITIALIZED_TIMESTAMP,
            expiration_timestamp: UNINITIALIZED_TIMESTAMP,
            singletons: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }
}

impl EntityData {
    /// Build entity data from a raw record.
    ///
    /// Each field is stamped with its entry in `field_versions`, falling back
    /// to `entity_version` for fields without one.
    pub fn from_raw(
        raw: &RawEntity,
        entity_version: &VersionMap,
        field_versions: &BTreeMap<FieldName, VersionMap>,
    ) -> Self {
        let version_of = |field: &str| {
            field_versions
                .get(field)
                .cloned()
                .unwrap_or_else(|| entity_version.clone())
        };

        let singletons = raw
            .singletons
            .iter()
            .map(|(field, value)| {
                let version = version_of(field);
                let mut data = SetData::new(version.clone());
                if let Some(value) = value {
                    data.insert(version, value.clone());
                }
                (field.clone(), CrdtSingleton::from_data(data))
            })
            .collect();

        let collections = raw
            .collections
            .iter()
            .map(|(field, values)| {
                let version = version_of(field);
                let mut data = SetData::new(version.clone());
                for value in values {
                    data.insert(version.clone(), value.clone());
                }
                (field.clone(), CrdtSet::from_data(data))
            })
            .collect();

        Self {
            version_map: entity_version.clone(),
            id: raw.id.clone(),
            creation_timestamp: raw.creation_timestamp,
            expiration_timestamp: raw.expiration_timestamp,
            singletons,
            collections,
        }
    }

    /// The raw view of this data.
    pub fn to_raw(&self) -> RawEntity {
        RawEntity {
            id: self.id.clone(),
            singletons: self
                .singletons
                .iter()
                .map(|(field, single)| (field.clone(), single.consumer_view()))
                .collect(),
            collections: self
                .collections
                .iter()
                .map(|(field, set)| (field.clone(), set.consumer_view().into_iter().collect()))
                .collect(),
            creation_timestamp: self.creation_timestamp,
            expiration_timestamp: self.expiration_timestamp,
        }
    }
}

impl CrdtData for EntityData {
    fn version_map(&self) -> &VersionMap {
        &self.version_map
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum EntityOperation {
    SetSingleton {
        actor: Actor,
        clock: VersionMap,
        field: FieldName,
        value: Primitive,
    },
    ClearSingleton {
        actor: Actor,
        clock: VersionMap,
        field: FieldName,
    },
    AddToSet {
        actor: Actor,
        clock: VersionMap,
        field: FieldName,
        added: Primitive,
    },
    RemoveFromSet {
        actor: Actor,
        clock: VersionMap,
        field: FieldName,
        removed: Primitive,
    },
    /// Clear every field the clock has observed and reset the timestamps.
    ClearAll { actor: Actor, clock: VersionMap },
}

impl CrdtOperation for EntityOperation {
    fn clock(&self) -> &VersionMap {
        match self {
            EntityOperation::SetSingleton { clock, .. }
            | EntityOperation::ClearSingleton { clock, .. }
            | EntityOperation::AddToSet { clock, .. }
            | EntityOperation::RemoveFromSet { clock, .. }
            | EntityOperation::ClearAll { clock, .. } => clock,
        }
    }
}

impl EntityOperation {
    /// Express a collection-field operation at entity level.
    ///
    /// Only plain adds and removes have an entity form.
    fn from_set_op(field: &str, op: SetOperation<Primitive>) -> Option<Self> {
        match op {
            SetOperation::Add {
                actor,
                clock,
                added,
            } => Some(EntityOperation::AddToSet {
                actor,
                clock,
                field: field.to_string(),
                added,
            }),
            SetOperation::Remove {
                actor,
                clock,
                removed,
            } => Some(EntityOperation::RemoveFromSet {
                actor,
                clock,
                field: field.to_string(),
                removed,
            }),
            SetOperation::Clear { .. } | SetOperation::FastForward { .. } => None,
        }
    }
}

/// Operations collected for one side of a merge.
///
/// `exact` drops to false as soon as some change can only be expressed as
/// full data.
struct SideDelta {
    ops: Vec<EntityOperation>,
    exact: bool,
}

impl SideDelta {
    fn new() -> Self {
        Self {
            ops: Vec::new(),
            exact: true,
        }
    }

    fn push_set_change(
        &mut self,
        field: &str,
        change: CrdtChange<SetData<Primitive>, SetOperation<Primitive>>,
    ) {
        match change {
            CrdtChange::Operations(ops) => {
                for op in ops {
                    match EntityOperation::from_set_op(field, op) {
                        Some(op) => self.ops.push(op),
                        None => self.exact = false,
                    }
                }
            }
            CrdtChange::Data(_) => self.exact = false,
        }
    }

    fn push_singleton_change<O>(&mut self, change: &CrdtChange<SetData<Primitive>, O>) {
        if !change.is_empty() {
            self.exact = false;
        }
    }

    /// Resolve to a change record that takes `before` to `target`.
    fn into_change(
        self,
        before: &EntityData,
        target: &EntityData,
    ) -> CrdtChange<EntityData, EntityOperation> {
        if before == target {
            return CrdtChange::empty();
        }
        let metadata_agrees = before.id == target.id
            && before.creation_timestamp == target.creation_timestamp
            && before.expiration_timestamp == target.expiration_timestamp;
        let mut reached = before.version_map.clone();
        for op in &self.ops {
            reached.merge(op.clock());
        }
        if self.exact && metadata_agrees && !self.ops.is_empty() && reached == target.version_map {
            CrdtChange::Operations(self.ops)
        } else {
            CrdtChange::Data(target.clone())
        }
    }
}

fn merge_timestamp(a: i64, b: i64) -> i64 {
    match (a, b) {
        (UNINITIALIZED_TIMESTAMP, other) | (other, UNINITIALIZED_TIMESTAMP) => other,
        (a, b) => a.min(b),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrdtEntity {
    data: EntityData,
}

impl CrdtEntity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty entity with the given id and fields.
    pub fn with_fields<'a>(
        id: impl Into<ReferenceId>,
        singleton_fields: impl IntoIterator<Item = &'a str>,
        collection_fields: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let data = EntityData {
            id: id.into(),
            singletons: singleton_fields
                .into_iter()
                .map(|field| (field.to_string(), CrdtSingleton::new()))
                .collect(),
            collections: collection_fields
                .into_iter()
                .map(|field| (field.to_string(), CrdtSet::new()))
                .collect(),
            ..EntityData::default()
        };
        Self { data }
    }

    pub fn id(&self) -> &str {
        &self.data.id
    }

    fn singleton_mut(&mut self, field: &str) -> Result<&mut CrdtSingleton<Primitive>> {
        self.data.singletons.get_mut(field).ok_or_else(|| {
            CRDTError::InvalidField {
                field: field.to_string(),
            }
            .into()
        })
    }

    fn collection_mut(&mut self, field: &str) -> Result<&mut CrdtSet<Primitive>> {
        self.data.collections.get_mut(field).ok_or_else(|| {
            CRDTError::InvalidField {
                field: field.to_string(),
            }
            .into()
        })
    }
}

impl CrdtModel for CrdtEntity {
    type Data = EntityData;
    type Operation = EntityOperation;
    type ConsumerView = RawEntity;

    fn from_data(data: EntityData) -> Self {
        Self { data }
    }

    fn data(&self) -> EntityData {
        self.data.clone()
    }

    fn version_map(&self) -> VersionMap {
        self.data.version_map.clone()
    }

    fn consumer_view(&self) -> RawEntity {
        self.data.to_raw()
    }

    fn merge(&mut self, other: EntityData) -> Result<MergeChanges<EntityData, EntityOperation>> {
        let mut next = self.data.clone();

        next.id = match (self.data.id.is_empty(), other.id.is_empty()) {
            (_, true) => self.data.id.clone(),
            (true, false) => other.id.clone(),
            (false, false) if self.data.id == other.id => self.data.id.clone(),
            (false, false) => {
                return Err(CRDTError::ConflictingIds {
                    ours: self.data.id.clone(),
                    theirs: other.id.clone(),
                }
                .into());
            }
        };
        next.creation_timestamp =
            merge_timestamp(self.data.creation_timestamp, other.creation_timestamp);
        next.expiration_timestamp =
            merge_timestamp(self.data.expiration_timestamp, other.expiration_timestamp);

        let mut model_delta = SideDelta::new();
        let mut other_delta = SideDelta::new();

        for (field, theirs) in &other.singletons {
            match next.singletons.get_mut(field) {
                Some(mine) => {
                    let changes = mine.merge(theirs.data())?;
                    model_delta.push_singleton_change(&changes.model_change);
                    other_delta.push_singleton_change(&changes.other_change);
                }
                None => {
                    next.singletons.insert(field.clone(), theirs.clone());
                    model_delta.exact = false;
                }
            }
        }
        if next.singletons.len() != other.singletons.len() {
            other_delta.exact = false;
        }

        for (field, theirs) in &other.collections {
            match next.collections.get_mut(field) {
                Some(mine) => {
                    let changes = mine.merge(theirs.data())?;
                    model_delta.push_set_change(field, changes.model_change);
                    other_delta.push_set_change(field, changes.other_change);
                }
                None => {
                    next.collections.insert(field.clone(), theirs.clone());
                    model_delta.exact = false;
                }
            }
        }
        if next.collections.len() != other.collections.len() {
            other_delta.exact = false;
        }

        next.version_map.merge(&other.version_map);

        let model_change = model_delta.into_change(&self.data, &next);
        let other_change = other_delta.into_change(&other, &next);
        trace!(
            id = %next.id,
            version = %next.version_map,
            model_is_data = model_change.is_data(),
            other_is_data = other_change.is_data(),
            "merged entity"
        );
        self.data = next;

        Ok(MergeChanges {
            model_change,
            other_change,
        })
    }

    fn apply_operation(&mut self, op: &EntityOperation) -> Result<bool> {
        let applied = match op {
            EntityOperation::SetSingleton {
                actor,
                clock,
                field,
                value,
            } => self
                .singleton_mut(field)?
                .apply_operation(&SingletonOperation::Update {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    value: value.clone(),
                })?,
            EntityOperation::ClearSingleton {
                actor,
                clock,
                field,
            } => self
                .singleton_mut(field)?
                .apply_operation(&SingletonOperation::Clear {
                    actor: actor.clone(),
                    clock: clock.clone(),
                })?,
            EntityOperation::AddToSet {
                actor,
                clock,
                field,
                added,
            } => self.collection_mut(field)?.apply_operation(&SetOperation::Add {
                actor: actor.clone(),
                clock: clock.clone(),
                added: added.clone(),
            })?,
            EntityOperation::RemoveFromSet {
                actor,
                clock,
                field,
                removed,
            } => self
                .collection_mut(field)?
                .apply_operation(&SetOperation::Remove {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    removed: removed.clone(),
                })?,
            EntityOperation::ClearAll { clock, .. } => {
                for single in self.data.singletons.values_mut() {
                    single.clear_dominated(clock);
                }
                for set in self.data.collections.values_mut() {
                    set.clear_dominated(clock);
                }
                self.data.creation_timestamp = UNINITIALIZED_TIMESTAMP;
                self.data.expiration_timestamp = UNINITIALIZED_TIMESTAMP;
                true
            }
        };
        if applied {
            self.data.version_map.merge(op.clock());
        }
        Ok(applied)
    }

    fn update_data(&mut self, data: EntityData) {
        self.data = data;
    }
}
