//! Version vectors (per-actor logical clocks)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Opaque actor identifier.
pub type Actor = String;

/// Causal relationship between two version maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Equal,
    /// Every counter is `>=` and at least one is `>`.
    Dominates,
    Dominated,
    Concurrent,
}

/// Mapping from actor to a non-decreasing counter. Missing actors read as 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionMap(BTreeMap<Actor, u64>);

impl VersionMap {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build a version map from `(actor, counter)` pairs.
    pub fn from_entries<A: Into<Actor>>(entries: impl IntoIterator<Item = (A, u64)>) -> Self {
        let mut map = Self::new();
        for (actor, counter) in entries {
            map.set(actor, counter);
        }
        map
    }

    pub fn get(&self, actor: &str) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    /// Sets the counter for `actor`. Zero counters are not stored so that
    /// `{a: 0}` and `{}` compare equal.
    pub fn set(&mut self, actor: impl Into<Actor>, counter: u64) {
        let actor = actor.into();
        if counter == 0 {
            self.0.remove(&actor);
        } else {
            self.0.insert(actor, counter);
        }
    }

    /// Bumps `actor` by one and returns the new counter.
    pub fn increment(&mut self, actor: &str) -> u64 {
        self.increment_by(actor, 1)
    }

    /// Bumps `actor` by `delta` and returns the new counter.
    pub fn increment_by(&mut self, actor: &str, delta: u64) -> u64 {
        let next = self.get(actor) + delta;
        self.set(actor, next);
        next
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Actor, u64)> {
        self.0.iter().map(|(actor, counter)| (actor, *counter))
    }

    /// Per-actor maximum of both maps.
    pub fn merge_with(&self, other: &VersionMap) -> VersionMap {
        let mut merged = self.clone();
        merged.merge_in(other);
        merged
    }

    /// In-place variant of [`merge_with`](Self::merge_with).
    pub fn merge_in(&mut self, other: &VersionMap) {
        for (actor, counter) in other.iter() {
            if counter > self.get(actor) {
                self.0.insert(actor.clone(), counter);
            }
        }
    }

    pub fn compare(&self, other: &VersionMap) -> Causality {
        let mut greater = false;
        let mut less = false;
        for actor in self.0.keys().chain(other.0.keys()) {
            match self.get(actor).cmp(&other.get(actor)) {
                Ordering::Greater => greater = true,
                Ordering::Less => less = true,
                Ordering::Equal => {}
            }
            if greater && less {
                return Causality::Concurrent;
            }
        }
        match (greater, less) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Dominates,
            (false, true) => Causality::Dominated,
            (true, true) => Causality::Concurrent,
        }
    }

    /// Strict dominance: every counter `>=` and at least one `>`.
    pub fn dominates(&self, other: &VersionMap) -> bool {
        self.compare(other) == Causality::Dominates
    }

    /// Every counter in `self` is `>=` the corresponding counter in `other`.
    pub fn dominates_or_equals(&self, other: &VersionMap) -> bool {
        matches!(self.compare(other), Causality::Dominates | Causality::Equal)
    }

    /// Actors whose counters differ between the two maps.
    pub fn difference(&self, other: &VersionMap) -> Vec<Actor> {
        self.0
            .keys()
            .chain(other.0.keys())
            .filter(|actor| self.get(actor) != other.get(actor))
            .fold(Vec::new(), |mut acc, actor| {
                if !acc.contains(actor) {
                    acc.push(actor.clone());
                }
                acc
            })
    }

    /// The entry with the highest counter, ties broken by the greatest actor id.
    ///
    /// Gives a total order over concurrent writes.
    pub fn highest_entry(&self) -> Option<(u64, &Actor)> {
        self.0
            .iter()
            .map(|(actor, counter)| (*counter, actor))
            .max()
    }
}

impl fmt::Display for VersionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (actor, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", actor, counter)?;
        }
        write!(f, "}}")
    }
}

impl<A: Into<Actor>> FromIterator<(A, u64)> for VersionMap {
    fn from_iter<I: IntoIterator<Item = (A, u64)>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}

/// Picks the winner between two versions of the same element.
///
/// Returns `true` when `theirs` should replace `mine`: `theirs` dominates, or
/// the two are concurrent and `theirs` has the greater highest entry.
pub(crate) fn prefers_other(mine: &VersionMap, theirs: &VersionMap) -> bool {
    match mine.compare(theirs) {
        Causality::Dominated => true,
        Causality::Concurrent => theirs.highest_entry() > mine.highest_entry(),
        Causality::Equal | Causality::Dominates => false,
    }
}
