//! Per-actor vector clocks.
//!
//! A [`VersionMap`] maps each actor to the number of writes it has made. Every
//! CRDT in this crate uses one to decide whether an operation is the next
//! expected write for its actor and whether one replica has observed
//! everything another has.
//!
//! # Examples
//!
//! ```
//! use convergent::crdt::VersionMap;
//!
//! let mut a = VersionMap::new();
//! a.increment("alice");
//! a.increment("alice");
//!
//! let b = VersionMap::from([("bob", 1)]);
//! assert!(!a.dominates(&b));
//!
//! let merged = a.merge_with(&b);
//! assert_eq!(merged.get("alice"), 2);
//! assert_eq!(merged.get("bob"), 1);
//! assert!(merged.dominates(&a) && merged.dominates(&b));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a replica or writer tracked by a [`VersionMap`].
pub type Actor = String;

/// Vector clock mapping actors to non-negative versions.
///
/// Absent actors have version 0. Entries are never stored with a zero value,
/// so two maps that agree on every actor compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionMap {
    versions: BTreeMap<Actor, u64>,
}

impl VersionMap {
    /// Create an empty version map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Version recorded for `actor`, 0 if absent.
    pub fn get(&self, actor: &str) -> u64 {
        self.versions.get(actor).copied().unwrap_or(0)
    }

    /// Set the version for `actor`. Setting 0 removes the entry.
    pub fn set(&mut self, actor: impl Into<Actor>, version: u64) {
        let actor = actor.into();
        if version == 0 {
            self.versions.remove(&actor);
        } else {
            self.versions.insert(actor, version);
        }
    }

    /// Increment the version for `actor` and return the new value.
    pub fn increment(&mut self, actor: &str) -> u64 {
        let next = self.get(actor) + 1;
        self.versions.insert(actor.to_string(), next);
        next
    }

    /// Copy of this map with `actor` moved back by one version.
    ///
    /// Saturates at zero.
    pub fn decremented(&self, actor: &str) -> VersionMap {
        let mut copy = self.clone();
        copy.set(actor, self.get(actor).saturating_sub(1));
        copy
    }

    /// True if every actor's version in `other` is at most this map's version.
    pub fn dominates(&self, other: &VersionMap) -> bool {
        other
            .versions
            .iter()
            .all(|(actor, version)| self.get(actor) >= *version)
    }

    /// Neither map dominates the other.
    pub fn is_concurrent_with(&self, other: &VersionMap) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Pointwise maximum of both maps, as a new map.
    pub fn merge_with(&self, other: &VersionMap) -> VersionMap {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    /// Raise every actor in this map to at least its version in `other`.
    pub fn merge(&mut self, other: &VersionMap) {
        for (actor, version) in &other.versions {
            let entry = self.versions.entry(actor.clone()).or_insert(0);
            *entry = (*entry).max(*version);
        }
    }

    /// Pointwise positive difference: actors where this map is ahead of `other`.
    pub fn minus(&self, other: &VersionMap) -> VersionMap {
        let versions = self
            .versions
            .iter()
            .filter_map(|(actor, version)| {
                let diff = version.saturating_sub(other.get(actor));
                (diff > 0).then(|| (actor.clone(), diff))
            })
            .collect();
        VersionMap { versions }
    }

    /// Actors with a non-zero version, in sorted order.
    pub fn actors(&self) -> impl Iterator<Item = &str> {
        self.versions.keys().map(String::as_str)
    }

    /// Iterate `(actor, version)` pairs in actor order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.versions.iter().map(|(a, v)| (a.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl<A: Into<Actor>, const N: usize> From<[(A, u64); N]> for VersionMap {
    fn from(pairs: [(A, u64); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl<A: Into<Actor>> FromIterator<(A, u64)> for VersionMap {
    fn from_iter<I: IntoIterator<Item = (A, u64)>>(iter: I) -> Self {
        let mut map = VersionMap::new();
        for (actor, version) in iter {
            map.set(actor, version);
        }
        map
    }
}

impl fmt::Display for VersionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (actor, version)) in self.versions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{actor}: {version}")?;
        }
        write!(f, "}}")
    }
}
