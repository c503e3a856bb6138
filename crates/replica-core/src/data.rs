//! Values stored in CRDTs: primitives, references and raw entities

use crate::storage_key::StorageKey;
use crate::version::VersionMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a value inside a CRDT set.
pub type ReferenceId = String;

/// Name of an entity field.
pub type FieldName = String;

/// Anything that can live in a CRDT set has a stable identity.
pub trait Referencable {
    fn id(&self) -> ReferenceId;
}

/// A primitive field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Primitive {
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Primitive {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Primitive::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Primitive::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Primitive::Number(n) => Some(*n),
            Primitive::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Primitive::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl Referencable for Primitive {
    /// Tagged textual form, so `Int(1)` and `Text("1")` never collide.
    fn id(&self) -> ReferenceId {
        match self {
            Primitive::Bool(b) => format!("bool:{}", b),
            Primitive::Int(n) => format!("int:{}", n),
            Primitive::Number(n) => format!("num:{}", n),
            Primitive::Text(s) => format!("text:{}", s),
            Primitive::Bytes(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                format!("bytes:{}", hex)
            }
        }
    }
}

/// Pointer to an entity held in another store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub id: ReferenceId,
    pub storage_key: StorageKey,
    /// Version of the referenced entity this reference was created against.
    /// Empty when unknown.
    #[serde(default)]
    pub version: VersionMap,
    #[serde(default)]
    pub is_hard_reference: bool,
}

impl Reference {
    pub fn new(id: impl Into<ReferenceId>, storage_key: StorageKey) -> Self {
        Self {
            id: id.into(),
            storage_key,
            version: VersionMap::new(),
            is_hard_reference: false,
        }
    }

    pub fn with_version(mut self, version: VersionMap) -> Self {
        self.version = version;
        self
    }

    pub fn hard(mut self) -> Self {
        self.is_hard_reference = true;
        self
    }

    /// `true` for hard references into a foreign namespace.
    pub fn is_foreign(&self) -> bool {
        matches!(self.storage_key, StorageKey::Foreign { .. })
    }
}

impl Referencable for Reference {
    fn id(&self) -> ReferenceId {
        self.id.clone()
    }
}

/// A value held by an entity field or a CRDT collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Primitive(Primitive),
    Reference(Reference),
    /// Inline entity, stored by value.
    Entity(Box<RawEntity>),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn text(s: impl Into<String>) -> Self {
        FieldValue::Primitive(Primitive::Text(s.into()))
    }

    pub fn int(n: i64) -> Self {
        FieldValue::Primitive(Primitive::Int(n))
    }

    pub fn as_primitive(&self) -> Option<&Primitive> {
        match self {
            FieldValue::Primitive(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            FieldValue::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&RawEntity> {
        match self {
            FieldValue::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_entity(self) -> Option<RawEntity> {
        match self {
            FieldValue::Entity(e) => Some(*e),
            _ => None,
        }
    }

    /// The reference itself, or every reference nested inside.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            FieldValue::Primitive(_) => {}
            FieldValue::Reference(r) => out.push(r),
            FieldValue::Entity(e) => e.collect_references(out),
            FieldValue::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
        }
    }
}

impl Referencable for FieldValue {
    fn id(&self) -> ReferenceId {
        match self {
            FieldValue::Primitive(p) => p.id(),
            FieldValue::Reference(r) => r.id.clone(),
            FieldValue::Entity(e) => e.id.clone(),
            FieldValue::List(items) => {
                let ids: Vec<String> = items.iter().map(|item| item.id()).collect();
                format!("[{}]", ids.join(","))
            }
        }
    }
}

impl From<RawEntity> for FieldValue {
    fn from(entity: RawEntity) -> Self {
        FieldValue::Entity(Box::new(entity))
    }
}

impl From<Reference> for FieldValue {
    fn from(reference: Reference) -> Self {
        FieldValue::Reference(reference)
    }
}

impl From<Primitive> for FieldValue {
    fn from(primitive: Primitive) -> Self {
        FieldValue::Primitive(primitive)
    }
}

/// An entity as seen by consumers: plain field values, no CRDT metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEntity {
    pub id: ReferenceId,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub creation_timestamp: Option<i64>,
    /// Milliseconds since the epoch. `None` never expires.
    #[serde(default)]
    pub expiration_timestamp: Option<i64>,
    #[serde(default)]
    pub singletons: BTreeMap<FieldName, Option<FieldValue>>,
    #[serde(default)]
    pub collections: BTreeMap<FieldName, Vec<FieldValue>>,
}

impl RawEntity {
    pub fn new(id: impl Into<ReferenceId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_singleton(mut self, field: impl Into<FieldName>, value: Option<FieldValue>) -> Self {
        self.singletons.insert(field.into(), value);
        self
    }

    pub fn with_collection(mut self, field: impl Into<FieldName>, values: Vec<FieldValue>) -> Self {
        self.collections.insert(field.into(), values);
        self
    }

    pub fn singleton(&self, field: &str) -> Option<&FieldValue> {
        self.singletons.get(field).and_then(|v| v.as_ref())
    }

    pub fn collection(&self, field: &str) -> &[FieldValue] {
        self.collections
            .get(field)
            .map(|values| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration_timestamp.is_some_and(|exp| exp <= now)
    }

    /// Every reference held by this entity, including ones nested in
    /// inline entities and lists.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    /// Hard references only.
    pub fn hard_references(&self) -> Vec<&Reference> {
        self.references()
            .into_iter()
            .filter(|r| r.is_hard_reference)
            .collect()
    }

    /// Whether this entity holds a hard reference to `id`, optionally
    /// restricted to references stored under `storage_key`.
    pub fn has_hard_reference_to(&self, storage_key: Option<&StorageKey>, id: &str) -> bool {
        self.hard_references()
            .iter()
            .any(|r| r.id == id && storage_key.map_or(true, |key| &r.storage_key == key))
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        for value in self.singletons.values().flatten() {
            value.collect_references(out);
        }
        for values in self.collections.values() {
            for value in values {
                value.collect_references(out);
            }
        }
    }
}

impl Referencable for RawEntity {
    fn id(&self) -> ReferenceId {
        self.id.clone()
    }
}

impl fmt::Display for RawEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawEntity({})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foreign(id: &str) -> Reference {
        Reference::new(id, StorageKey::foreign("accounts")).hard()
    }

    #[test]
    fn test_primitive_ids_are_tagged() {
        assert_ne!(Primitive::Int(1).id(), Primitive::Text("1".into()).id());
        assert_eq!(Primitive::Bytes(vec![0xde, 0xad]).id(), "bytes:dead");
    }

    #[test]
    fn test_list_id_joins_elements() {
        let list = FieldValue::List(vec![FieldValue::int(1), FieldValue::text("a")]);
        assert_eq!(list.id(), "[int:1,text:a]");
    }

    #[test]
    fn test_hard_references_walk_nested_values() {
        let child = RawEntity::new("child")
            .with_singleton("owner", Some(FieldValue::Reference(foreign("id1"))));
        let parent = RawEntity::new("p1")
            .with_singleton("child", Some(child.into()))
            .with_collection(
                "refs",
                vec![FieldValue::List(vec![FieldValue::Reference(foreign("id2"))])],
            )
            .with_singleton(
                "soft",
                Some(FieldValue::Reference(Reference::new(
                    "id3",
                    StorageKey::foreign("accounts"),
                ))),
            );

        let ids: Vec<&str> = parent.hard_references().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["id1", "id2"]);
        assert_eq!(parent.references().len(), 3);
        assert!(parent.has_hard_reference_to(None, "id1"));
        assert!(!parent.has_hard_reference_to(None, "id3"));
    }

    #[test]
    fn test_expiry() {
        let mut entity = RawEntity::new("e");
        assert!(!entity.is_expired(i64::MAX));
        entity.expiration_timestamp = Some(100);
        assert!(entity.is_expired(100));
        assert!(!entity.is_expired(99));
    }

    #[test]
    fn test_json_shape() {
        let value = FieldValue::int(5);
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["kind"], "primitive");
        assert_eq!(json["value"]["type"], "int");
        let back: FieldValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, value);
    }
}
