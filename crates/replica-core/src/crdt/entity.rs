//! Entity CRDT: named singleton and collection fields under one clock

use super::set::{CrdtSet, SetData, SetOperation};
use super::singleton::{apply_singleton_op, winner, CrdtSingleton, SingletonOperation};
use super::{CrdtChange, MergeChanges};
use crate::data::{FieldName, FieldValue, RawEntity, ReferenceId};
use crate::error::CrdtError;
use crate::version::{Actor, VersionMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub version_map: VersionMap,
    pub id: ReferenceId,
    #[serde(default)]
    pub creation_timestamp: Option<i64>,
    #[serde(default)]
    pub expiration_timestamp: Option<i64>,
    #[serde(default)]
    pub singletons: BTreeMap<FieldName, SetData<FieldValue>>,
    #[serde(default)]
    pub collections: BTreeMap<FieldName, SetData<FieldValue>>,
}

impl EntityData {
    /// Builds entity data with every field at `version`.
    pub fn from_raw(entity: &RawEntity, version: VersionMap) -> Self {
        let field_version = version.clone();
        Self::from_raw_with(entity, version, |_| field_version.clone())
    }

    /// Builds entity data with per-field versions.
    pub fn from_raw_with(
        entity: &RawEntity,
        version: VersionMap,
        field_version: impl Fn(&str) -> VersionMap,
    ) -> Self {
        let singletons = entity
            .singletons
            .iter()
            .map(|(field, value)| {
                let data = SetData::with_values(field_version(field), value.clone());
                (field.clone(), data)
            })
            .collect();
        let collections = entity
            .collections
            .iter()
            .map(|(field, values)| {
                let data = SetData::with_values(field_version(field), values.iter().cloned());
                (field.clone(), data)
            })
            .collect();

        Self {
            version_map: version,
            id: entity.id.clone(),
            creation_timestamp: entity.creation_timestamp,
            expiration_timestamp: entity.expiration_timestamp,
            singletons,
            collections,
        }
    }

    pub fn to_raw_entity(&self) -> RawEntity {
        RawEntity {
            id: self.id.clone(),
            creation_timestamp: self.creation_timestamp,
            expiration_timestamp: self.expiration_timestamp,
            singletons: self
                .singletons
                .iter()
                .map(|(field, data)| (field.clone(), winner(data).map(|e| e.value.clone())))
                .collect(),
            collections: self
                .collections
                .iter()
                .map(|(field, data)| {
                    let values = data.values.values().map(|e| e.value.clone()).collect();
                    (field.clone(), values)
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityOperation {
    SetSingleton {
        actor: Actor,
        clock: VersionMap,
        field: FieldName,
        value: FieldValue,
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
        added: FieldValue,
    },
    RemoveFromSet {
        actor: Actor,
        clock: VersionMap,
        field: FieldName,
        removed: FieldValue,
    },
    /// Clears every field at its own version and resets timestamps.
    ClearAll { actor: Actor, clock: VersionMap },
}

impl EntityOperation {
    pub fn clock(&self) -> &VersionMap {
        match self {
            EntityOperation::SetSingleton { clock, .. }
            | EntityOperation::ClearSingleton { clock, .. }
            | EntityOperation::AddToSet { clock, .. }
            | EntityOperation::RemoveFromSet { clock, .. }
            | EntityOperation::ClearAll { clock, .. } => clock,
        }
    }

    fn from_singleton_op(field: &str, op: SingletonOperation<FieldValue>) -> Self {
        match op {
            SingletonOperation::Update {
                actor,
                clock,
                value,
            } => EntityOperation::SetSingleton {
                actor,
                clock,
                field: field.to_string(),
                value,
            },
            SingletonOperation::Clear { actor, clock } => EntityOperation::ClearSingleton {
                actor,
                clock,
                field: field.to_string(),
            },
        }
    }

    /// `None` for set operations with no entity-level equivalent.
    fn from_set_op(field: &str, op: SetOperation<FieldValue>) -> Option<Self> {
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

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrdtEntity {
    data: EntityData,
}

impl CrdtEntity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: EntityData) -> Self {
        Self { data }
    }

    pub fn from_raw(entity: &RawEntity, version: VersionMap) -> Self {
        Self::from_data(EntityData::from_raw(entity, version))
    }

    pub fn data(&self) -> &EntityData {
        &self.data
    }

    pub fn into_data(self) -> EntityData {
        self.data
    }

    pub fn version_map(&self) -> &VersionMap {
        &self.data.version_map
    }

    pub fn consumer_view(&self) -> RawEntity {
        self.data.to_raw_entity()
    }

    pub fn apply_operation(&mut self, op: &EntityOperation) -> Result<bool, CrdtError> {
        let applied = match op {
            EntityOperation::SetSingleton {
                actor,
                clock,
                field,
                value,
            } => apply_singleton_op(
                singleton_field(&mut self.data, field)?,
                &SingletonOperation::Update {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    value: value.clone(),
                },
            ),
            EntityOperation::ClearSingleton {
                actor,
                clock,
                field,
            } => apply_singleton_op(
                singleton_field(&mut self.data, field)?,
                &SingletonOperation::Clear {
                    actor: actor.clone(),
                    clock: clock.clone(),
                },
            ),
            EntityOperation::AddToSet {
                actor,
                clock,
                field,
                added,
            } => super::set::apply_to(
                collection_field(&mut self.data, field)?,
                &SetOperation::Add {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    added: added.clone(),
                },
            ),
            EntityOperation::RemoveFromSet {
                actor,
                clock,
                field,
                removed,
            } => super::set::apply_to(
                collection_field(&mut self.data, field)?,
                &SetOperation::Remove {
                    actor: actor.clone(),
                    clock: clock.clone(),
                    removed: removed.clone(),
                },
            ),
            EntityOperation::ClearAll { .. } => {
                for data in self
                    .data
                    .singletons
                    .values_mut()
                    .chain(self.data.collections.values_mut())
                {
                    let field_clock = data.version_map.clone();
                    data.values
                        .retain(|_, element| !field_clock.dominates_or_equals(&element.version_map));
                }
                self.data.creation_timestamp = None;
                self.data.expiration_timestamp = None;
                true
            }
        };

        if applied {
            self.data.version_map.merge_in(op.clock());
        }
        Ok(applied)
    }

    /// Field-wise merge. Creation merges to the earliest timestamp. An
    /// expiration already set here is kept, so the first writer's TTL
    /// sticks and later writes only fill it in when it is missing.
    pub fn merge(&mut self, other: &EntityData) -> MergeChanges<EntityData, EntityOperation> {
        let mut all_ops = true;
        let mut model_ops = Vec::new();
        let mut other_ops = Vec::new();

        for (field, theirs) in &other.singletons {
            match self.data.singletons.get(field) {
                Some(mine) => {
                    let mut singleton = CrdtSingleton::from_data(mine.clone());
                    let changes = singleton.merge(theirs);
                    all_ops &= collect_singleton_ops(field, changes, &mut model_ops, &mut other_ops);
                    self.data.singletons.insert(field.clone(), singleton.into_data());
                }
                None => {
                    self.data.singletons.insert(field.clone(), theirs.clone());
                    all_ops = false;
                }
            }
        }
        for field in self.data.singletons.keys() {
            if !other.singletons.contains_key(field) {
                all_ops = false;
            }
        }

        for (field, theirs) in &other.collections {
            match self.data.collections.get(field) {
                Some(mine) => {
                    let mut set = CrdtSet::from_data(mine.clone());
                    let changes = set.merge(theirs);
                    all_ops &= collect_set_ops(field, changes, &mut model_ops, &mut other_ops);
                    self.data.collections.insert(field.clone(), set.into_data());
                }
                None => {
                    self.data.collections.insert(field.clone(), theirs.clone());
                    all_ops = false;
                }
            }
        }
        for field in self.data.collections.keys() {
            if !other.collections.contains_key(field) {
                all_ops = false;
            }
        }

        if self.data.id.is_empty() {
            self.data.id = other.id.clone();
        }

        let creation = min_some(self.data.creation_timestamp, other.creation_timestamp);
        let expiration = self.data.expiration_timestamp.or(other.expiration_timestamp);
        if creation != self.data.creation_timestamp
            || expiration != self.data.expiration_timestamp
            || creation != other.creation_timestamp
            || expiration != other.expiration_timestamp
        {
            all_ops = false;
        }
        self.data.creation_timestamp = creation;
        self.data.expiration_timestamp = expiration;

        let old_version = self.data.version_map.clone();
        self.data.version_map.merge_in(&other.version_map);

        let unchanged = old_version == self.data.version_map
            && other.version_map == self.data.version_map
            && model_ops.is_empty()
            && other_ops.is_empty();
        if all_ops || unchanged {
            MergeChanges {
                model_change: CrdtChange::Operations(model_ops),
                other_change: CrdtChange::Operations(other_ops),
            }
        } else {
            MergeChanges {
                model_change: CrdtChange::Data(self.data.clone()),
                other_change: CrdtChange::Data(self.data.clone()),
            }
        }
    }
}

fn singleton_field<'a>(data: &'a mut EntityData, field: &str) -> Result<&'a mut SetData<FieldValue>, CrdtError> {
    data.singletons
        .get_mut(field)
        .ok_or_else(|| CrdtError::InvalidField(field.to_string()))
}

fn collection_field<'a>(data: &'a mut EntityData, field: &str) -> Result<&'a mut SetData<FieldValue>, CrdtError> {
    data.collections
        .get_mut(field)
        .ok_or_else(|| CrdtError::InvalidField(field.to_string()))
}

/// Returns `false` when a change can't be expressed as entity operations.
fn collect_singleton_ops(
    field: &str,
    changes: MergeChanges<SetData<FieldValue>, SingletonOperation<FieldValue>>,
    model_ops: &mut Vec<EntityOperation>,
    other_ops: &mut Vec<EntityOperation>,
) -> bool {
    let mut expressible = true;
    for (change, out) in [(changes.model_change, model_ops), (changes.other_change, other_ops)] {
        match change {
            CrdtChange::Operations(ops) => out.extend(
                ops.into_iter()
                    .map(|op| EntityOperation::from_singleton_op(field, op)),
            ),
            CrdtChange::Data(_) => expressible = false,
        }
    }
    expressible
}

fn collect_set_ops(
    field: &str,
    changes: MergeChanges<SetData<FieldValue>, SetOperation<FieldValue>>,
    model_ops: &mut Vec<EntityOperation>,
    other_ops: &mut Vec<EntityOperation>,
) -> bool {
    let mut expressible = true;
    for (change, out) in [(changes.model_change, model_ops), (changes.other_change, other_ops)] {
        match change {
            CrdtChange::Operations(ops) => {
                for op in ops {
                    match EntityOperation::from_set_op(field, op) {
                        Some(op) => out.push(op),
                        None => expressible = false,
                    }
                }
            }
            CrdtChange::Data(_) => expressible = false,
        }
    }
    expressible
}

fn min_some(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
