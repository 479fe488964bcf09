//! Grow-only counter.
//!
//! Each actor owns one monotonically increasing slot; the consumer view is
//! the sum of all slots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::crdt::{
    Actor, CRDTError, CrdtChange, CrdtData, CrdtModel, CrdtOperation, MergeChanges, VersionMap,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountData {
    pub version_map: VersionMap,
    pub values: BTreeMap<Actor, u64>,
}

impl CrdtData for CountData {
    fn version_map(&self) -> &VersionMap {
        &self.version_map
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum CountOperation {
    /// Add one; `clock[actor]` must be exactly the actor's next version.
    Increment { actor: Actor, clock: VersionMap },
    /// Add `delta`; `clock[actor]` may skip ahead of the actor's current version.
    MultiIncrement {
        actor: Actor,
        clock: VersionMap,
        delta: u64,
    },
}

impl CrdtOperation for CountOperation {
    fn clock(&self) -> &VersionMap {
        match self {
            CountOperation::Increment { clock, .. }
            | CountOperation::MultiIncrement { clock, .. } => clock,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrdtCount {
    data: CountData,
}

impl CrdtCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value contributed by `actor`.
    pub fn actor_value(&self, actor: &str) -> u64 {
        self.data.values.get(actor).copied().unwrap_or(0)
    }
}

/// Per-actor merge of `other` into `data`.
///
/// Returns the merged data plus the increments each side is missing.
/// Sum of every actor's value, or `None` if it does not fit in a `u64`.
fn checked_total(values: &BTreeMap<Actor, u64>) -> Option<u64> {
    values
        .values()
        .try_fold(0u64, |total, value| total.checked_add(*value))
}

fn merge_counts(
    data: &CountData,
    other: &CountData,
) -> Result<(CountData, Vec<CountOperation>, Vec<CountOperation>)> {
    let mut merged = data.clone();
    let mut mine_ops = Vec::new();
    let mut other_ops = Vec::new();

    let actors: std::collections::BTreeSet<&Actor> =
        data.values.keys().chain(other.values.keys()).collect();

    for actor in actors {
        let my_value = data.values.get(actor).copied().unwrap_or(0);
        let their_value = other.values.get(actor).copied().unwrap_or(0);
        let my_version = data.version_map.get(actor);
        let their_version = other.version_map.get(actor);

        if my_version == their_version {
            if my_value != their_value {
                return Err(CRDTError::DivergentVersion {
                    reason: format!(
                        "actor '{actor}' has values {my_value} and {their_value} at version {my_version}"
                    ),
                }
                .into());
            }
            continue;
        }

        let (ahead_value, behind_value) = if my_version > their_version {
            (my_value, their_value)
        } else {
            (their_value, my_value)
        };
        if ahead_value < behind_value {
            return Err(CRDTError::DivergentVersion {
                reason: format!(
                    "actor '{actor}' value went backwards from {behind_value} to {ahead_value}"
                ),
            }
            .into());
        }
        let delta = ahead_value - behind_value;

        if my_version > their_version {
            if delta > 0 {
                other_ops.push(CountOperation::MultiIncrement {
                    actor: actor.clone(),
                    clock: VersionMap::from([(actor.clone(), my_version)]),
                    delta,
                });
            }
        } else {
            merged.values.insert(actor.clone(), their_value);
            if delta > 0 {
                mine_ops.push(CountOperation::MultiIncrement {
                    actor: actor.clone(),
                    clock: VersionMap::from([(actor.clone(), their_version)]),
                    delta,
                });
            }
        }
    }

    if checked_total(&merged.values).is_none() {
        return Err(CRDTError::InvalidOperation {
            reason: "merged count does not fit in a u64".to_string(),
        }
        .into());
    }
    merged.version_map.merge(&other.version_map);
    Ok((merged, mine_ops, other_ops))
}

impl CrdtModel for CrdtCount {
    type Data = CountData;
    type Operation = CountOperation;
    type ConsumerView = u64;

    fn from_data(data: CountData) -> Self {
        Self { data }
    }

    fn data(&self) -> CountData {
        self.data.clone()
    }

    fn version_map(&self) -> VersionMap {
        self.data.version_map.clone()
    }

    fn consumer_view(&self) -> u64 {
        self.data
            .values
            .values()
            .fold(0u64, |total, value| total.saturating_add(*value))
    }

    fn merge(&mut self, other: CountData) -> Result<MergeChanges<CountData, CountOperation>> {
        let (merged, mine_ops, other_ops) = merge_counts(&self.data, &other)?;
        self.data = merged;
        Ok(MergeChanges {
            model_change: CrdtChange::Operations(mine_ops),
            other_change: CrdtChange::Operations(other_ops),
        })
    }

    fn apply_operation(&mut self, op: &CountOperation) -> Result<bool> {
        let (actor, clock, delta) = match op {
            CountOperation::Increment { actor, clock } => {
                if clock.get(actor) != self.data.version_map.get(actor) + 1 {
                    return Ok(false);
                }
                (actor, clock, 1)
            }
            CountOperation::MultiIncrement {
                actor,
                clock,
                delta,
            } => {
                if *delta == 0 {
                    return Err(CRDTError::InvalidOperation {
                        reason: "MultiIncrement delta must be positive".to_string(),
                    }
                    .into());
                }
                if clock.get(actor) <= self.data.version_map.get(actor) {
                    return Ok(false);
                }
                (actor, clock, *delta)
            }
        };
        // The total bounds every actor's value, so checking it covers both.
        if checked_total(&self.data.values)
            .and_then(|total| total.checked_add(delta))
            .is_none()
        {
            return Err(CRDTError::InvalidOperation {
                reason: format!("incrementing '{actor}' by {delta} overflows the count"),
            }
            .into());
        }
        *self.data.values.entry(actor.clone()).or_insert(0) += delta;
        self.data.version_map.set(actor.as_str(), clock.get(actor));
        Ok(true)
    }

    fn update_data(&mut self, data: CountData) {
        self.data = data;
    }
}
