//! Single-value register built on the observed-remove set

use super::set::{apply_to, CrdtSet, SetData, SetElement, SetOperation};
use super::{CrdtChange, MergeChanges};
use crate::data::Referencable;
use crate::version::{Actor, Causality, VersionMap};
use serde::{Deserialize, Serialize};

/// Singleton state has the same shape as set state.
pub type SingletonData<T> = SetData<T>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SingletonOperation<T> {
    Update {
        actor: Actor,
        clock: VersionMap,
        value: T,
    },
    Clear {
        actor: Actor,
        clock: VersionMap,
    },
}

impl<T> SingletonOperation<T> {
    pub fn clock(&self) -> &VersionMap {
        match self {
            SingletonOperation::Update { clock, .. } | SingletonOperation::Clear { clock, .. } => {
                clock
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
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

impl<T: Referencable + Clone + PartialEq> CrdtSingleton<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: SingletonData<T>) -> Self {
        Self {
            set: CrdtSet::from_data(data),
        }
    }

    /// A singleton holding `value` (if any) at `version`.
    pub fn with_value(version: VersionMap, value: Option<T>) -> Self {
        Self::from_data(SetData::with_values(version, value))
    }

    pub fn data(&self) -> &SingletonData<T> {
        self.set.data()
    }

    pub fn into_data(self) -> SingletonData<T> {
        self.set.into_data()
    }

    pub fn version_map(&self) -> &VersionMap {
        self.set.version_map()
    }

    /// The live value: concurrent writes may leave several candidates, of
    /// which the undominated one with the greatest `(counter, actor)` wins.
    pub fn consumer_view(&self) -> Option<T> {
        winner(self.data()).map(|e| e.value.clone())
    }

    pub fn apply_operation(&mut self, op: &SingletonOperation<T>) -> bool {
        apply_singleton_op(self.set.data_mut(), op)
    }

    pub fn merge(&mut self, other: &SingletonData<T>) -> MergeChanges<SingletonData<T>, SingletonOperation<T>> {
        let changes = self.set.merge(other);
        let model_change = if changes.model_change.is_empty() {
            CrdtChange::Operations(Vec::new())
        } else {
            CrdtChange::Data(self.data().clone())
        };
        let other_change = if changes.other_change.is_empty() {
            CrdtChange::Operations(Vec::new())
        } else {
            CrdtChange::Data(self.data().clone())
        };
        MergeChanges {
            model_change,
            other_change,
        }
    }
}

pub(crate) fn apply_singleton_op<T: Referencable + Clone>(
    data: &mut SetData<T>,
    op: &SingletonOperation<T>,
) -> bool {
    match op {
        SingletonOperation::Update {
            actor,
            clock,
            value,
        } => {
            if clock.get(actor) != data.version_map.get(actor) + 1 {
                return false;
            }
            // Clear what the writer had observed before this update.
            let mut observed = clock.clone();
            observed.set(actor.clone(), clock.get(actor) - 1);
            data.values
                .retain(|_, element| !observed.dominates_or_equals(&element.version_map));
            apply_to(
                data,
                &SetOperation::Add {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    added: value.clone(),
                },
            )
        }
        SingletonOperation::Clear { actor, clock } => apply_to(
            data,
            &SetOperation::Clear {
                actor: actor.clone(),
                clock: clock.clone(),
            },
        ),
    }
}

pub(crate) fn winner<T>(data: &SetData<T>) -> Option<&SetElement<T>> {
    let candidates: Vec<&SetElement<T>> = data.values.values().collect();
    candidates
        .iter()
        .filter(|e| {
            !candidates
                .iter()
                .any(|other| other.version_map.compare(&e.version_map) == Causality::Dominates)
        })
        .max_by(|a, b| a.version_map.highest_entry().cmp(&b.version_map.highest_entry()))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FieldValue;

    fn update(
        singleton: &mut CrdtSingleton<FieldValue>,
        actor: &str,
        value: &str,
    ) -> SingletonOperation<FieldValue> {
        let mut clock = singleton.version_map().clone();
        clock.increment(actor);
        let op = SingletonOperation::Update {
            actor: actor.into(),
            clock,
            value: FieldValue::text(value),
        };
        assert!(singleton.apply_operation(&op));
        op
    }

    #[test]
    fn test_update_replaces_value() {
        let mut s = CrdtSingleton::new();
        update(&mut s, "alice", "one");
        update(&mut s, "alice", "two");
        assert_eq!(s.consumer_view(), Some(FieldValue::text("two")));
        assert_eq!(s.data().values.len(), 1);
        assert_eq!(s.version_map().get("alice"), 2);
    }

    #[test]
    fn test_clear() {
        let mut s = CrdtSingleton::new();
        update(&mut s, "alice", "one");
        let clear = SingletonOperation::Clear {
            actor: "alice".into(),
            clock: s.version_map().clone(),
        };
        assert!(s.apply_operation(&clear));
        assert_eq!(s.consumer_view(), None);
    }

    #[test]
    fn test_concurrent_updates_converge_on_one_winner() {
        let mut a = CrdtSingleton::new();
        update(&mut a, "alice", "from-alice");
        let mut b = CrdtSingleton::new();
        update(&mut b, "bob", "from-bob");

        let mut ab = a.clone();
        ab.merge(b.data());
        let mut ba = b.clone();
        ba.merge(a.data());

        assert_eq!(ab.data(), ba.data());
        assert_eq!(ab.consumer_view(), ba.consumer_view());
        assert_eq!(ab.consumer_view(), Some(FieldValue::text("from-bob")));

        // The next update observes and clears both candidates.
        update(&mut ab, "alice", "settled");
        assert_eq!(ab.data().values.len(), 1);
    }

    #[test]
    fn test_merge_reports_data_changes() {
        let mut a = CrdtSingleton::new();
        update(&mut a, "alice", "x");
        let mut b: CrdtSingleton<FieldValue> = CrdtSingleton::new();

        let changes = b.merge(a.data());
        assert!(matches!(changes.model_change, CrdtChange::Data(_)));
        assert!(changes.other_change.is_empty());

        let again = b.merge(a.data());
        assert!(again.model_change.is_empty());
    }
}
