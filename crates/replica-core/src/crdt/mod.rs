//! CRDT models
//!
//! Each model kind (count, set, singleton, entity) has its own data and
//! operation types. [`CrdtData`], [`CrdtOperation`] and [`CrdtModel`] close
//! over the four kinds so stores and the wire protocol can carry any of
//! them, with merge and apply dispatched by exhaustive matching.

pub mod count;
pub mod entity;
pub mod set;
pub mod singleton;

pub use count::{CountData, CountOperation, CrdtCount};
pub use entity::{CrdtEntity, EntityData, EntityOperation};
pub use set::{CrdtSet, SetData, SetElement, SetOperation};
pub use singleton::{CrdtSingleton, SingletonData, SingletonOperation};

use crate::data::{FieldValue, RawEntity};
use crate::error::CrdtError;
use crate::version::VersionMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A change produced by merge: either replayable operations or a full
/// state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CrdtChange<D, O> {
    Operations(Vec<O>),
    Data(D),
}

impl<D, O> CrdtChange<D, O> {
    pub fn is_empty(&self) -> bool {
        matches!(self, CrdtChange::Operations(ops) if ops.is_empty())
    }

    pub fn map<D2, O2>(self, data: impl FnOnce(D) -> D2, op: impl FnMut(O) -> O2) -> CrdtChange<D2, O2> {
        match self {
            CrdtChange::Operations(ops) => CrdtChange::Operations(ops.into_iter().map(op).collect()),
            CrdtChange::Data(d) => CrdtChange::Data(data(d)),
        }
    }
}

/// What merge changed locally, and what the other side is missing.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeChanges<D, O> {
    pub model_change: CrdtChange<D, O>,
    pub other_change: CrdtChange<D, O>,
}

impl<D, O> MergeChanges<D, O> {
    fn map<D2, O2>(self, data: impl Fn(D) -> D2, op: impl Fn(O) -> O2) -> MergeChanges<D2, O2> {
        MergeChanges {
            model_change: self.model_change.map(&data, &op),
            other_change: self.other_change.map(&data, &op),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrdtKind {
    Count,
    Set,
    Singleton,
    Entity,
}

impl fmt::Display for CrdtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrdtKind::Count => write!(f, "count"),
            CrdtKind::Set => write!(f, "set"),
            CrdtKind::Singleton => write!(f, "singleton"),
            CrdtKind::Entity => write!(f, "entity"),
        }
    }
}

impl std::str::FromStr for CrdtKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "count" => Ok(CrdtKind::Count),
            "set" | "collection" => Ok(CrdtKind::Set),
            "singleton" => Ok(CrdtKind::Singleton),
            "entity" => Ok(CrdtKind::Entity),
            _ => Err(crate::Error::Crdt(CrdtError::InvalidOperation(format!(
                "Unknown CRDT kind: {}",
                s
            )))),
        }
    }
}

/// State of any CRDT kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CrdtData {
    Count(CountData),
    Set(SetData<FieldValue>),
    Singleton(SingletonData<FieldValue>),
    Entity(EntityData),
}

impl CrdtData {
    pub fn empty(kind: CrdtKind) -> Self {
        match kind {
            CrdtKind::Count => CrdtData::Count(CountData::default()),
            CrdtKind::Set => CrdtData::Set(SetData::default()),
            CrdtKind::Singleton => CrdtData::Singleton(SetData::default()),
            CrdtKind::Entity => CrdtData::Entity(EntityData::default()),
        }
    }

    pub fn kind(&self) -> CrdtKind {
        match self {
            CrdtData::Count(_) => CrdtKind::Count,
            CrdtData::Set(_) => CrdtKind::Set,
            CrdtData::Singleton(_) => CrdtKind::Singleton,
            CrdtData::Entity(_) => CrdtKind::Entity,
        }
    }

    pub fn version_map(&self) -> &VersionMap {
        match self {
            CrdtData::Count(d) => &d.version_map,
            CrdtData::Set(d) | CrdtData::Singleton(d) => &d.version_map,
            CrdtData::Entity(d) => &d.version_map,
        }
    }

    /// Set and singleton contents, regardless of which of the two it is.
    pub fn as_collection(&self) -> Option<&SetData<FieldValue>> {
        match self {
            CrdtData::Set(d) | CrdtData::Singleton(d) => Some(d),
            _ => None,
        }
    }
}

/// An operation against any CRDT kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "op", rename_all = "snake_case")]
pub enum CrdtOperation {
    Count(CountOperation),
    Set(SetOperation<FieldValue>),
    Singleton(SingletonOperation<FieldValue>),
    Entity(EntityOperation),
}

impl CrdtOperation {
    pub fn kind(&self) -> CrdtKind {
        match self {
            CrdtOperation::Count(_) => CrdtKind::Count,
            CrdtOperation::Set(_) => CrdtKind::Set,
            CrdtOperation::Singleton(_) => CrdtKind::Singleton,
            CrdtOperation::Entity(_) => CrdtKind::Entity,
        }
    }

    /// Clock after the operation. Count operations report their target
    /// version for their actor only.
    pub fn clock(&self) -> VersionMap {
        match self {
            CrdtOperation::Count(op) => {
                let to = match op {
                    CountOperation::Increment { to, .. } | CountOperation::MultiIncrement { to, .. } => *to,
                };
                VersionMap::from_entries([(op.actor().to_string(), to)])
            }
            CrdtOperation::Set(op) => op.clock().clone(),
            CrdtOperation::Singleton(op) => op.clock().clone(),
            CrdtOperation::Entity(op) => op.clock().clone(),
        }
    }
}

pub type ModelChange = CrdtChange<CrdtData, CrdtOperation>;
pub type ModelMergeChanges = MergeChanges<CrdtData, CrdtOperation>;

/// Owning wrapper dispatching merge and apply over [`CrdtData`].
#[derive(Debug, Clone, PartialEq)]
pub struct CrdtModel {
    data: CrdtData,
}

impl CrdtModel {
    pub fn new(kind: CrdtKind) -> Self {
        Self {
            data: CrdtData::empty(kind),
        }
    }

    pub fn from_data(data: CrdtData) -> Self {
        Self { data }
    }

    pub fn kind(&self) -> CrdtKind {
        self.data.kind()
    }

    pub fn data(&self) -> &CrdtData {
        &self.data
    }

    pub fn version_map(&self) -> &VersionMap {
        self.data.version_map()
    }

    /// Merges `other` into this model. On error the model is unchanged.
    pub fn merge(&mut self, other: &CrdtData) -> Result<ModelMergeChanges, CrdtError> {
        let changes = match (&mut self.data, other) {
            (CrdtData::Count(mine), CrdtData::Count(theirs)) => {
                let mut model = CrdtCount::from_data(std::mem::take(mine));
                let result = model.merge(theirs);
                *mine = model.into_data();
                result?.map(CrdtData::Count, CrdtOperation::Count)
            }
            (CrdtData::Set(mine), CrdtData::Set(theirs)) => {
                let mut model = CrdtSet::from_data(std::mem::take(mine));
                let changes = model.merge(theirs);
                *mine = model.into_data();
                changes.map(CrdtData::Set, CrdtOperation::Set)
            }
            (CrdtData::Singleton(mine), CrdtData::Singleton(theirs)) => {
                let mut model = CrdtSingleton::from_data(std::mem::take(mine));
                let changes = model.merge(theirs);
                *mine = model.into_data();
                changes.map(CrdtData::Singleton, CrdtOperation::Singleton)
            }
            (CrdtData::Entity(mine), CrdtData::Entity(theirs)) => {
                let mut model = CrdtEntity::from_data(std::mem::take(mine));
                let changes = model.merge(theirs);
                *mine = model.into_data();
                changes.map(CrdtData::Entity, CrdtOperation::Entity)
            }
            (mine, theirs) => {
                return Err(CrdtError::TypeMismatch {
                    expected: mine.kind().to_string(),
                    got: theirs.kind().to_string(),
                })
            }
        };
        Ok(changes)
    }

    /// `Ok(false)` signals a causality gap: the caller should resync.
    pub fn apply_operation(&mut self, op: &CrdtOperation) -> Result<bool, CrdtError> {
        match (&mut self.data, op) {
            (CrdtData::Count(data), CrdtOperation::Count(op)) => {
                let mut model = CrdtCount::from_data(std::mem::take(data));
                let result = model.apply_operation(op);
                *data = model.into_data();
                result
            }
            (CrdtData::Set(data), CrdtOperation::Set(op)) => Ok(set::apply_to(data, op)),
            (CrdtData::Singleton(data), CrdtOperation::Singleton(op)) => {
                Ok(singleton::apply_singleton_op(data, op))
            }
            (CrdtData::Entity(data), CrdtOperation::Entity(op)) => {
                let mut model = CrdtEntity::from_data(std::mem::take(data));
                let result = model.apply_operation(op);
                *data = model.into_data();
                result
            }
            (data, op) => Err(CrdtError::TypeMismatch {
                expected: data.kind().to_string(),
                got: op.kind().to_string(),
            }),
        }
    }

    /// Live values of a set or singleton.
    pub fn values(&self) -> Vec<FieldValue> {
        match &self.data {
            CrdtData::Set(data) => data.values.values().map(|e| e.value.clone()).collect(),
            CrdtData::Singleton(data) => singleton::winner(data)
                .map(|e| vec![e.value.clone()])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Live entities of a set or singleton of inline entities.
    pub fn entities(&self) -> Vec<RawEntity> {
        self.values()
            .into_iter()
            .filter_map(FieldValue::into_entity)
            .collect()
    }

    /// Takes `other`'s value for every set or singleton element held on
    /// both sides at the same version. Returns whether anything changed.
    pub fn adopt_values(&mut self, other: &CrdtData) -> bool {
        let mine = match &mut self.data {
            CrdtData::Set(data) | CrdtData::Singleton(data) => data,
            _ => return false,
        };
        let Some(theirs) = other.as_collection() else {
            return false;
        };
        let mut changed = false;
        for (id, element) in mine.values.iter_mut() {
            if let Some(other) = theirs.values.get(id) {
                if other.version_map == element.version_map && other.value != element.value {
                    element.value = other.value.clone();
                    changed = true;
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_dispatch() {
        let mut model = CrdtModel::new(CrdtKind::Set);
        let mut clock = VersionMap::new();
        clock.increment("alice");
        let op = CrdtOperation::Set(SetOperation::Add {
            actor: "alice".into(),
            clock,
            added: RawEntity::new("e1").into(),
        });
        assert!(model.apply_operation(&op).unwrap());
        assert_eq!(model.entities(), vec![RawEntity::new("e1")]);
    }

    #[test]
    fn test_adopt_values_only_replaces_same_version_elements() {
        let clock = VersionMap::from_entries([("alice", 1)]);
        let mut model = CrdtModel::new(CrdtKind::Set);
        let op = CrdtOperation::Set(SetOperation::Add {
            actor: "alice".into(),
            clock: clock.clone(),
            added: RawEntity::new("e1").into(),
        });
        assert!(model.apply_operation(&op).unwrap());

        let mut stamped = RawEntity::new("e1");
        stamped.expiration_timestamp = Some(60_000);
        let newer = SetData::with_values(clock.clone(), [FieldValue::from(stamped.clone())]);
        assert!(model.adopt_values(&CrdtData::Set(newer)));
        assert_eq!(model.entities(), vec![stamped.clone()]);

        let later = VersionMap::from_entries([("alice", 2)]);
        let other = SetData::with_values(later, [FieldValue::from(RawEntity::new("e1"))]);
        assert!(!model.adopt_values(&CrdtData::Set(other)));
        assert_eq!(model.entities(), vec![stamped]);
    }

    #[test]
    fn test_kind_mismatch_is_an_error() {
        let mut model = CrdtModel::new(CrdtKind::Set);
        let before = model.clone();
        let err = model.merge(&CrdtData::empty(CrdtKind::Count)).unwrap_err();
        assert!(matches!(err, CrdtError::TypeMismatch { .. }));
        assert_eq!(model, before);
    }

    #[test]
    fn test_malformed_count_merge_leaves_model_unchanged() {
        let mut count = CrdtCount::new();
        count.increment("alice");
        let mut model = CrdtModel::from_data(CrdtData::Count(count.data().clone()));
        let before = model.clone();

        let mut bogus = count.data().clone();
        bogus.values.insert("alice".into(), 9);
        assert!(model.merge(&CrdtData::Count(bogus)).is_err());
        assert_eq!(model, before);
    }

    #[test]
    fn test_json_round_trip_of_data() {
        let mut model = CrdtModel::new(CrdtKind::Singleton);
        let op = CrdtOperation::Singleton(SingletonOperation::Update {
            actor: "a".into(),
            clock: VersionMap::from_entries([("a", 1)]),
            value: FieldValue::text("hello"),
        });
        assert!(model.apply_operation(&op).unwrap());

        let json = serde_json::to_string(model.data()).unwrap();
        let back: CrdtData = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, model.data());
    }
}
