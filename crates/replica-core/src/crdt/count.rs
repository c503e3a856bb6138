//! Grow-only counter

use super::{CrdtChange, MergeChanges};
use crate::error::CrdtError;
use crate::version::{Actor, VersionMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountData {
    pub values: BTreeMap<Actor, i64>,
    pub version_map: VersionMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CountOperation {
    /// Adds one. `to` must be `from + 1`.
    Increment { actor: Actor, from: u64, to: u64 },
    /// Adds `delta` (> 0) in one step.
    MultiIncrement {
        actor: Actor,
        from: u64,
        to: u64,
        delta: i64,
    },
}

impl CountOperation {
    pub fn actor(&self) -> &str {
        match self {
            CountOperation::Increment { actor, .. } | CountOperation::MultiIncrement { actor, .. } => {
                actor
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrdtCount {
    data: CountData,
}

impl CrdtCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: CountData) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &CountData {
        &self.data
    }

    pub fn into_data(self) -> CountData {
        self.data
    }

    pub fn version_map(&self) -> &VersionMap {
        &self.data.version_map
    }

    /// Sum over every actor's contribution.
    pub fn value(&self) -> i64 {
        self.data.values.values().sum()
    }

    /// Builds and applies an increment for `actor`, returning the operation
    /// to broadcast.
    pub fn increment(&mut self, actor: &str) -> CountOperation {
        let from = self.data.version_map.get(actor);
        let op = CountOperation::Increment {
            actor: actor.to_string(),
            from,
            to: from + 1,
        };
        *self.data.values.entry(actor.to_string()).or_insert(0) += 1;
        self.data.version_map.set(actor, from + 1);
        op
    }

    /// Returns `Ok(false)` when `from` does not match the local version.
    pub fn apply_operation(&mut self, op: &CountOperation) -> Result<bool, CrdtError> {
        let (actor, from, to, delta) = match op {
            CountOperation::Increment { actor, from, to } => {
                if *to != from + 1 {
                    return Err(CrdtError::InvalidOperation(format!(
                        "increment must advance the version by one, got {} -> {}",
                        from, to
                    )));
                }
                (actor, *from, *to, 1)
            }
            CountOperation::MultiIncrement {
                actor,
                from,
                to,
                delta,
            } => {
                if *delta <= 0 {
                    return Err(CrdtError::InvalidOperation(format!(
                        "delta must be positive, got {}",
                        delta
                    )));
                }
                (actor, *from, *to, *delta)
            }
        };

        if from != self.data.version_map.get(actor) || to <= from {
            return Ok(false);
        }
        *self.data.values.entry(actor.clone()).or_insert(0) += delta;
        self.data.version_map.set(actor.clone(), to);
        Ok(true)
    }

    /// Per-actor maximum. Both sides having the same version for an actor
    /// with different counts is malformed input and leaves `self` untouched.
    pub fn merge(
        &mut self,
        other: &CountData,
    ) -> Result<MergeChanges<CountData, CountOperation>, CrdtError> {
        let mut merged = self.data.clone();
        let mut model_ops = Vec::new();
        let mut other_ops = Vec::new();

        for (actor, &theirs) in &other.values {
            let mine = self.data.values.get(actor).copied().unwrap_or(0);
            let my_version = self.data.version_map.get(actor);
            let their_version = other.version_map.get(actor);

            if mine == theirs {
                continue;
            }
            if my_version == their_version {
                return Err(conflict(actor, my_version, mine, theirs));
            }
            if theirs > mine {
                if their_version < my_version {
                    return Err(conflict(actor, my_version, mine, theirs));
                }
                model_ops.push(CountOperation::MultiIncrement {
                    actor: actor.clone(),
                    from: my_version,
                    to: their_version,
                    delta: theirs - mine,
                });
                merged.values.insert(actor.clone(), theirs);
            } else {
                if my_version < their_version {
                    return Err(conflict(actor, my_version, mine, theirs));
                }
                other_ops.push(CountOperation::MultiIncrement {
                    actor: actor.clone(),
                    from: their_version,
                    to: my_version,
                    delta: mine - theirs,
                });
            }
        }

        for (actor, &mine) in &self.data.values {
            if !other.values.contains_key(actor) && mine > 0 {
                other_ops.push(CountOperation::MultiIncrement {
                    actor: actor.clone(),
                    from: other.version_map.get(actor),
                    to: self.data.version_map.get(actor),
                    delta: mine,
                });
            }
        }

        merged.version_map.merge_in(&other.version_map);
        self.data = merged;

        Ok(MergeChanges {
            model_change: CrdtChange::Operations(model_ops),
            other_change: CrdtChange::Operations(other_ops),
        })
    }
}

fn conflict(actor: &str, version: u64, mine: i64, theirs: i64) -> CrdtError {
    CrdtError::MergeConflict {
        actor: actor.to_string(),
        detail: format!(
            "divergent counts {} and {} around version {}",
            mine, theirs, version
        ),
    }
}
