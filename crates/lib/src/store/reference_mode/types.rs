//! Collection types shared by reference-mode proxies and the container store.
//!
//! Proxies see collections of full [`RawEntity`] records, the container store
//! holds collections of [`Reference`]s. Both are expressed with the same
//! generic shapes so an operation can be bridged by swapping its elements.

use serde::{Deserialize, Serialize};

use crate::crdt::{
    CrdtData, CrdtOperation, DataValue, RawEntity, ReferenceId, Referencable, SetData,
    SetOperation, SingletonOperation, VersionMap,
};
use crate::store::{CrdtType, StorageKey};

/// Pointer to a record in a backing store, at the version it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub id: ReferenceId,
    pub storage_key: StorageKey,
    /// Version the backing record must reach before this reference resolves.
    /// Empty for records that have never been written.
    pub version: VersionMap,
}

impl Reference {
    pub fn new(id: impl Into<ReferenceId>, storage_key: StorageKey, version: VersionMap) -> Self {
        Self {
            id: id.into(),
            storage_key,
            version,
        }
    }
}

impl Referencable for Reference {
    fn id(&self) -> ReferenceId {
        self.id.clone()
    }
}

/// Data of a set or singleton collection.
///
/// Singleton data is set data holding at most one visible value, so both
/// variants share [`SetData`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "container", content = "data")]
pub enum CollectionData<T> {
    Set(SetData<T>),
    Singleton(SetData<T>),
}

impl<T> CollectionData<T> {
    pub fn new(kind: CrdtType, data: SetData<T>) -> Self {
        match kind {
            CrdtType::Singleton => CollectionData::Singleton(data),
            _ => CollectionData::Set(data),
        }
    }

    pub fn kind(&self) -> CrdtType {
        match self {
            CollectionData::Set(_) => CrdtType::Set,
            CollectionData::Singleton(_) => CrdtType::Singleton,
        }
    }

    pub fn set_data(&self) -> &SetData<T> {
        match self {
            CollectionData::Set(data) | CollectionData::Singleton(data) => data,
        }
    }
}

impl<T: Referencable> CrdtData for CollectionData<T> {
    fn version_map(&self) -> &VersionMap {
        &self.set_data().version_map
    }
}

/// An operation on a set or singleton collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "container", content = "operation")]
pub enum CollectionOperation<T> {
    Set(SetOperation<T>),
    Singleton(SingletonOperation<T>),
}

impl<T: Referencable> CrdtOperation for CollectionOperation<T> {
    fn clock(&self) -> &VersionMap {
        match self {
            CollectionOperation::Set(op) => op.clock(),
            CollectionOperation::Singleton(op) => op.clock(),
        }
    }
}

impl<T> CollectionOperation<T> {
    pub fn kind(&self) -> CrdtType {
        match self {
            CollectionOperation::Set(_) => CrdtType::Set,
            CollectionOperation::Singleton(_) => CrdtType::Singleton,
        }
    }

    /// Elements this operation adds or updates.
    pub fn written(&self) -> Vec<&T> {
        match self {
            CollectionOperation::Set(SetOperation::Add { added, .. }) => vec![added],
            CollectionOperation::Set(SetOperation::FastForward { added, .. }) => {
                added.iter().map(|item| &item.value).collect()
            }
            CollectionOperation::Singleton(SingletonOperation::Update { value, .. }) => {
                vec![value]
            }
            _ => Vec::new(),
        }
    }

    /// Elements this operation removes.
    pub fn removed(&self) -> Vec<&T> {
        match self {
            CollectionOperation::Set(SetOperation::Remove { removed, .. }) => vec![removed],
            CollectionOperation::Set(SetOperation::FastForward { removed, .. }) => {
                removed.iter().collect()
            }
            _ => Vec::new(),
        }
    }

    /// The same operation with every element passed through `f`.
    pub fn map_elements<U>(self, mut f: impl FnMut(T) -> U) -> CollectionOperation<U> {
        match self {
            CollectionOperation::Set(op) => CollectionOperation::Set(match op {
                SetOperation::Add {
                    actor,
                    clock,
                    added,
                } => SetOperation::Add {
                    actor,
                    clock,
                    added: f(added),
                },
                SetOperation::Remove {
                    actor,
                    clock,
                    removed,
                } => SetOperation::Remove {
                    actor,
                    clock,
                    removed: f(removed),
                },
                SetOperation::Clear { actor, clock } => SetOperation::Clear { actor, clock },
                SetOperation::FastForward {
                    old_clock,
                    new_clock,
                    added,
                    removed,
                } => SetOperation::FastForward {
                    old_clock,
                    new_clock,
                    added: added
                        .into_iter()
                        .map(|item| DataValue::new(item.version_map, f(item.value)))
                        .collect(),
                    removed: removed.into_iter().map(&mut f).collect(),
                },
            }),
            CollectionOperation::Singleton(op) => CollectionOperation::Singleton(match op {
                SingletonOperation::Update {
                    actor,
                    clock,
                    value,
                } => SingletonOperation::Update {
                    actor,
                    clock,
                    value: f(value),
                },
                SingletonOperation::Clear { actor, clock } => {
                    SingletonOperation::Clear { actor, clock }
                }
            }),
        }
    }
}

/// Data proxies of a reference-mode store exchange.
pub type RefModeData = CollectionData<RawEntity>;

/// Operations proxies of a reference-mode store exchange.
pub type RefModeOperation = CollectionOperation<RawEntity>;

/// Map the values of collection data, keeping every version.
pub(crate) fn map_set_data<T, U: Referencable>(data: SetData<T>, mut f: impl FnMut(&str, T) -> U) -> SetData<U> {
    let mut mapped = SetData::new(data.version_map);
    for (id, item) in data.values {
        let value = f(&id, item.value);
        mapped.values.insert(id, DataValue::new(item.version_map, value));
    }
    mapped
}
