//! Observed-remove set

use super::{CrdtChange, MergeChanges};
use crate::data::{ReferenceId, Referencable};
use crate::version::{prefers_other, Actor, VersionMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A value and the version at which it was added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetElement<T> {
    pub version_map: VersionMap,
    pub value: T,
}

impl<T> SetElement<T> {
    pub fn new(version_map: VersionMap, value: T) -> Self {
        Self { version_map, value }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetData<T> {
    pub version_map: VersionMap,
    pub values: BTreeMap<ReferenceId, SetElement<T>>,
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
    /// Every value stored at `version`, with the set clock set to `version`.
    pub fn with_values(version: VersionMap, values: impl IntoIterator<Item = T>) -> Self {
        let values = values
            .into_iter()
            .map(|v| (v.id(), SetElement::new(version.clone(), v)))
            .collect();
        Self {
            version_map: version,
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SetOperation<T> {
    Add {
        actor: Actor,
        clock: VersionMap,
        added: T,
    },
    Remove {
        actor: Actor,
        clock: VersionMap,
        removed: T,
    },
    /// Removes everything `clock` has observed.
    Clear { actor: Actor, clock: VersionMap },
    /// Batch catch-up produced by merge.
    FastForward {
        old_clock: VersionMap,
        new_clock: VersionMap,
        added: Vec<SetElement<T>>,
        removed: Vec<T>,
    },
}

impl<T> SetOperation<T> {
    pub fn clock(&self) -> &VersionMap {
        match self {
            SetOperation::Add { clock, .. }
            | SetOperation::Remove { clock, .. }
            | SetOperation::Clear { clock, .. } => clock,
            SetOperation::FastForward { new_clock, .. } => new_clock,
        }
    }
}

impl<T: Referencable + Clone> SetOperation<T> {
    /// Rewrites a fast-forward whose additions all come from one actor in
    /// consecutive order as plain `Add`s. Anything else is returned as is.
    pub fn simplify(self) -> Vec<SetOperation<T>> {
        match self {
            SetOperation::FastForward {
                old_clock,
                new_clock,
                added,
                removed,
            } => match single_actor_adds(&old_clock, &new_clock, &added, &removed) {
                Some(adds) => adds,
                None => vec![SetOperation::FastForward {
                    old_clock,
                    new_clock,
                    added,
                    removed,
                }],
            },
            other => vec![other],
        }
    }
}

fn single_actor_adds<T: Clone>(
    old_clock: &VersionMap,
    new_clock: &VersionMap,
    added: &[SetElement<T>],
    removed: &[T],
) -> Option<Vec<SetOperation<T>>> {
    // Removals can't be replayed in order.
    if !removed.is_empty() || added.is_empty() {
        return None;
    }
    let diff = new_clock.difference(old_clock);
    let [actor] = diff.as_slice() else {
        return None;
    };

    let mut sorted: Vec<&SetElement<T>> = added.iter().collect();
    sorted.sort_by_key(|e| e.version_map.get(actor));
    let mut expected = old_clock.get(actor);
    for element in &sorted {
        expected += 1;
        if element.version_map.get(actor) != expected {
            return None;
        }
    }
    let mut expected_clock = old_clock.clone();
    expected_clock.set(actor.clone(), expected);
    if &expected_clock != new_clock {
        return None;
    }

    Some(
        sorted
            .into_iter()
            .map(|element| SetOperation::Add {
                actor: actor.clone(),
                clock: element.version_map.clone(),
                added: element.value.clone(),
            })
            .collect(),
    )
}

#[derive(Debug, Clone, PartialEq)]
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

impl<T: Referencable + Clone + PartialEq> CrdtSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: SetData<T>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &SetData<T> {
        &self.data
    }

    pub fn into_data(self) -> SetData<T> {
        self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut SetData<T> {
        &mut self.data
    }

    pub fn version_map(&self) -> &VersionMap {
        &self.data.version_map
    }

    /// Live values ordered by id.
    pub fn consumer_view(&self) -> Vec<T> {
        self.data.values.values().map(|e| e.value.clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.data.values.contains_key(id)
    }

    pub fn apply_operation(&mut self, op: &SetOperation<T>) -> bool {
        apply_to(&mut self.data, op)
    }

    pub fn merge(&mut self, other: &SetData<T>) -> MergeChanges<SetData<T>, SetOperation<T>> {
        let new_clock = self.data.version_map.merge_with(&other.version_map);
        let mut merged = SetData {
            version_map: new_clock.clone(),
            values: BTreeMap::new(),
        };
        let mut ff_added = Vec::new();
        let mut ff_removed = Vec::new();

        for (id, theirs) in &other.values {
            match self.data.values.get(id) {
                Some(mine) if mine == theirs => {
                    merged.values.insert(id.clone(), mine.clone());
                }
                Some(mine) => {
                    let value = if prefers_other(&mine.version_map, &theirs.version_map) {
                        theirs.value.clone()
                    } else {
                        mine.value.clone()
                    };
                    let element = SetElement::new(mine.version_map.merge_with(&theirs.version_map), value);
                    ff_added.push(element.clone());
                    merged.values.insert(id.clone(), element);
                }
                None if self.data.version_map.dominates_or_equals(&theirs.version_map) => {
                    // Observed here and removed.
                    ff_removed.push(theirs.value.clone());
                }
                None => {
                    merged.values.insert(id.clone(), theirs.clone());
                }
            }
        }

        for (id, mine) in &self.data.values {
            if !other.values.contains_key(id)
                && !other.version_map.dominates_or_equals(&mine.version_map)
            {
                merged.values.insert(id.clone(), mine.clone());
                ff_added.push(mine.clone());
            }
        }

        let other_change = if !ff_added.is_empty()
            || !ff_removed.is_empty()
            || other.version_map != new_clock
        {
            let fast_forward = SetOperation::FastForward {
                old_clock: other.version_map.clone(),
                new_clock,
                added: ff_added,
                removed: ff_removed,
            };
            CrdtChange::Operations(fast_forward.simplify())
        } else {
            CrdtChange::Operations(Vec::new())
        };

        let model_change = if merged == self.data {
            CrdtChange::Operations(Vec::new())
        } else {
            CrdtChange::Data(merged.clone())
        };
        self.data = merged;

        MergeChanges {
            model_change,
            other_change,
        }
    }
}

pub(crate) fn apply_to<T: Referencable + Clone>(data: &mut SetData<T>, op: &SetOperation<T>) -> bool {
    match op {
        SetOperation::Add {
            actor,
            clock,
            added,
        } => {
            // Only consecutive adds per actor are accepted.
            if clock.get(actor) != data.version_map.get(actor) + 1 {
                return false;
            }
            data.version_map.set(actor.clone(), clock.get(actor));
            let id = added.id();
            let version = match data.values.get(&id) {
                Some(previous) => clock.merge_with(&previous.version_map),
                None => clock.clone(),
            };
            data.values.insert(id, SetElement::new(version, added.clone()));
            true
        }
        SetOperation::Remove {
            actor,
            clock,
            removed,
        } => {
            if clock.get(actor) != data.version_map.get(actor) {
                return false;
            }
            let id = removed.id();
            // Unseen or concurrently re-added elements stay.
            if let Some(existing) = data.values.get(&id) {
                if clock.dominates_or_equals(&existing.version_map) {
                    data.values.remove(&id);
                }
            }
            true
        }
        SetOperation::Clear { actor, clock } => {
            if clock.get(actor) != data.version_map.get(actor) {
                return false;
            }
            data.values
                .retain(|_, element| !clock.dominates_or_equals(&element.version_map));
            true
        }
        SetOperation::FastForward {
            old_clock,
            new_clock,
            added,
            removed,
        } => {
            if !data.version_map.dominates_or_equals(old_clock) {
                return false;
            }
            if data.version_map.dominates_or_equals(new_clock) {
                return true;
            }
            for element in added {
                let id = element.value.id();
                match data.values.get_mut(&id) {
                    Some(existing) => {
                        if prefers_other(&existing.version_map, &element.version_map) {
                            existing.value = element.value.clone();
                        }
                        existing.version_map.merge_in(&element.version_map);
                    }
                    None if !data.version_map.dominates_or_equals(&element.version_map) => {
                        data.values.insert(id, element.clone());
                    }
                    None => {}
                }
            }
            for value in removed {
                let id = value.id();
                let covered = data
                    .values
                    .get(&id)
                    .is_some_and(|existing| new_clock.dominates_or_equals(&existing.version_map));
                if covered {
                    data.values.remove(&id);
                }
            }
            data.version_map.merge_in(new_clock);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FieldValue;

    fn vm(entries: &[(&str, u64)]) -> VersionMap {
        entries.iter().map(|(a, c)| (a.to_string(), *c)).collect()
    }

    fn add(set: &mut CrdtSet<FieldValue>, actor: &str, value: FieldValue) -> SetOperation<FieldValue> {
        let mut clock = set.version_map().clone();
        clock.increment(actor);
        let op = SetOperation::Add {
            actor: actor.into(),
            clock,
            added: value,
        };
        assert!(set.apply_operation(&op));
        op
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::text(s)
    }

    #[test]
    fn test_add_then_remove() {
        let mut set = CrdtSet::new();
        add(&mut set, "alice", text("x"));
        assert!(set.contains("text:x"));

        let remove = SetOperation::Remove {
            actor: "alice".into(),
            clock: set.version_map().clone(),
            removed: text("x"),
        };
        assert!(set.apply_operation(&remove));
        assert!(set.consumer_view().is_empty());
    }

    #[test]
    fn test_add_requires_consecutive_clock() {
        let mut set: CrdtSet<FieldValue> = CrdtSet::new();
        let op = SetOperation::Add {
            actor: "alice".into(),
            clock: vm(&[("alice", 2)]),
            added: text("x"),
        };
        assert!(!set.apply_operation(&op));
        assert!(set.consumer_view().is_empty());
    }

    #[test]
    fn test_remove_of_unseen_element_is_ignored() {
        let mut set: CrdtSet<FieldValue> = CrdtSet::new();
        let remove = SetOperation::Remove {
            actor: "bob".into(),
            clock: VersionMap::new(),
            removed: text("ghost"),
        };
        assert!(set.apply_operation(&remove));

        // Bob removes x without having seen alice's add.
        add(&mut set, "alice", text("x"));
        let concurrent = SetOperation::Remove {
            actor: "bob".into(),
            clock: VersionMap::new(),
            removed: text("x"),
        };
        assert!(set.apply_operation(&concurrent));
        assert!(set.contains("text:x"));
    }

    #[test]
    fn test_clear_removes_observed_values_only() {
        let mut set = CrdtSet::new();
        add(&mut set, "alice", text("a"));
        let observed = set.version_map().clone();
        add(&mut set, "bob", text("b"));

        let clear = SetOperation::Clear {
            actor: "alice".into(),
            clock: observed,
        };
        assert!(set.apply_operation(&clear));
        assert_eq!(set.consumer_view(), vec![text("b")]);
    }

    #[test]
    fn test_merge_is_commutative_and_idempotent() {
        let mut a = CrdtSet::new();
        add(&mut a, "alice", text("1"));
        add(&mut a, "alice", text("2"));
        let mut b = CrdtSet::new();
        add(&mut b, "bob", text("3"));

        let mut ab = a.clone();
        ab.merge(b.data());
        let mut ba = b.clone();
        ba.merge(a.data());
        assert_eq!(ab.data(), ba.data());
        assert_eq!(ab.consumer_view().len(), 3);

        let before = ab.data().clone();
        let changes = ab.merge(&before);
        assert!(changes.model_change.is_empty());
        assert_eq!(ab.data(), &before);
    }

    #[test]
    fn test_merge_is_associative() {
        let mut a = CrdtSet::new();
        add(&mut a, "alice", text("1"));
        let mut b = CrdtSet::new();
        add(&mut b, "bob", text("2"));
        let mut c = CrdtSet::new();
        add(&mut c, "carol", text("1"));

        let mut left = a.clone();
        left.merge(b.data());
        left.merge(c.data());

        let mut bc = b.clone();
        bc.merge(c.data());
        let mut right = a.clone();
        right.merge(bc.data());

        assert_eq!(left.data(), right.data());
    }

    #[test]
    fn test_merge_propagates_removal() {
        let mut a = CrdtSet::new();
        add(&mut a, "alice", text("x"));
        let mut b = a.clone();

        let remove = SetOperation::Remove {
            actor: "alice".into(),
            clock: a.version_map().clone(),
            removed: text("x"),
        };
        assert!(a.apply_operation(&remove));

        b.merge(a.data());
        assert!(!b.contains("text:x"));
    }

    #[test]
    fn test_other_change_simplifies_to_adds() {
        let mut a = CrdtSet::new();
        add(&mut a, "alice", text("1"));
        add(&mut a, "alice", text("2"));
        let mut b: CrdtSet<FieldValue> = CrdtSet::new();

        let changes = a.merge(b.data());
        let CrdtChange::Operations(ops) = changes.other_change else {
            panic!("expected operations");
        };
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| matches!(op, SetOperation::Add { .. })));
        for op in &ops {
            assert!(b.apply_operation(op));
        }
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_fast_forward_carries_removals() {
        let mut a = CrdtSet::new();
        add(&mut a, "alice", text("x"));
        let mut b = a.clone();
        add(&mut b, "bob", text("y"));
        let remove = SetOperation::Remove {
            actor: "bob".into(),
            clock: b.version_map().clone(),
            removed: text("x"),
        };
        assert!(b.apply_operation(&remove));

        let changes = b.merge(a.data());
        let CrdtChange::Operations(ops) = changes.other_change else {
            panic!("expected operations");
        };
        assert!(matches!(ops.as_slice(), [SetOperation::FastForward { .. }]));
        assert!(a.apply_operation(&ops[0]));
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_concurrent_values_for_same_id_pick_one_winner() {
        let entity = |name: &str| {
            FieldValue::from(
                crate::data::RawEntity::new("e1").with_singleton("name", Some(text(name))),
            )
        };
        let mut a = CrdtSet::new();
        add(&mut a, "alice", entity("from-alice"));
        let mut b = CrdtSet::new();
        add(&mut b, "bob", entity("from-bob"));

        let mut ab = a.clone();
        ab.merge(b.data());
        let mut ba = b.clone();
        ba.merge(a.data());
        assert_eq!(ab.data(), ba.data());
        assert_eq!(ab.consumer_view(), vec![entity("from-bob")]);
    }
}
