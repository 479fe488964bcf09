//! A single mutable value built on [`CrdtSet`].
//!
//! The singleton stores its value in an internal set. An update clears
//! everything the writer has observed and then adds the new value, so under
//! sequential use the set holds one element. Concurrent updates from
//! different actors can leave several elements behind; the consumer view
//! then picks the one with the smallest id, which every replica agrees on.

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::crdt::{
    Actor, CrdtChange, CrdtModel, CrdtOperation, CrdtSet, MergeChanges, Referencable,
    SetData, SetOperation, VersionMap,
};

/// Singleton state is plain set state.
pub type SingletonData<T> = SetData<T>;

/// Operations accepted by a [`CrdtSingleton`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum SingletonOperation<T> {
    /// Replace the current value; `clock[actor]` must be the actor's next version.
    Update {
        actor: Actor,
        clock: VersionMap,
        value: T,
    },
    /// Remove every value the clock has observed.
    Clear { actor: Actor, clock: VersionMap },
}

impl<T: Referencable> CrdtOperation for SingletonOperation<T> {
    fn clock(&self) -> &VersionMap {
        match self {
            SingletonOperation::Update { clock, .. } | SingletonOperation::Clear { clock, .. } => {
                clock
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrdtSingleton<T> {
    set: CrdtSet<T>,
}

impl<T> Default for CrdtSingleton<T> {
    fn default() -> Self {
        Self {
            set: CrdtSet::default(),
        }
    }
}

impl<T: Referencable> CrdtSingleton<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Singleton holding `value` written by `actor` at version 1.
    pub fn with_value(actor: &str, value: T) -> Self {
        let mut data = SetData::new(VersionMap::from([(actor, 1)]));
        data.insert(VersionMap::from([(actor, 1)]), value);
        Self::from_data(data)
    }

    /// Number of elements currently stored, normally 0 or 1.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Remove every value whose version `clock` dominates.
    fn clear(&mut self, actor: &str, clock: &VersionMap) -> Result<bool> {
        if clock.get(actor) != self.set.version_map().get(actor) {
            return Ok(false);
        }
        let dominated: Vec<T> = self
            .set
            .entries()
            .filter(|(_, item)| clock.dominates(&item.version_map))
            .map(|(_, item)| item.value.clone())
            .collect();
        for value in dominated {
            self.set.apply_operation(&SetOperation::Remove {
                actor: actor.to_string(),
                clock: clock.clone(),
                removed: value,
            })?;
        }
        Ok(true)
    }

    pub(crate) fn clear_dominated(&mut self, clock: &VersionMap) {
        self.set.clear_dominated(clock);
    }
}

impl<T: Referencable> CrdtModel for CrdtSingleton<T> {
    type Data = SingletonData<T>;
    type Operation = SingletonOperation<T>;
    type ConsumerView = Option<T>;

    fn from_data(data: SingletonData<T>) -> Self {
        Self {
            set: CrdtSet::from_data(data),
        }
    }

    fn data(&self) -> SingletonData<T> {
        self.set.data()
    }

    fn version_map(&self) -> VersionMap {
        self.set.version_map()
    }

    fn consumer_view(&self) -> Option<T> {
        self.set.entries().next().map(|(_, item)| item.value.clone())
    }

    fn merge(
        &mut self,
        other: SingletonData<T>,
    ) -> Result<MergeChanges<SingletonData<T>, SingletonOperation<T>>> {
        let changes = self.set.merge(other)?;
        let model_change = if changes.model_change.is_empty() {
            CrdtChange::empty()
        } else {
            CrdtChange::Data(self.set.data())
        };
        // Set deltas have no singleton equivalent, so send the whole value.
        let other_change = if changes.other_change.is_empty() {
            CrdtChange::empty()
        } else {
            CrdtChange::Data(self.set.data())
        };
        Ok(MergeChanges {
            model_change,
            other_change,
        })
    }

    fn apply_operation(&mut self, op: &SingletonOperation<T>) -> Result<bool> {
        match op {
            SingletonOperation::Update {
                actor,
                clock,
                value,
            } => {
                if clock.get(actor) != self.set.version_map().get(actor) + 1 {
                    return Ok(false);
                }
                // The writer incremented its version for the add; the clear
                // happens at the version before it.
                if !self.clear(actor, &clock.decremented(actor))? {
                    return Ok(false);
                }
                self.set.apply_operation(&SetOperation::Add {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    added: value.clone(),
                })
            }
            SingletonOperation::Clear { actor, clock } => self.clear(actor, clock),
        }
    }

    fn update_data(&mut self, data: SingletonData<T>) {
        self.set.update_data(data);
    }
}
