//! Replica Core - CRDT primitives and data model
//!
//! This crate provides the pure, I/O-free building blocks of Replica:
//! - Version maps (per-actor logical clocks)
//! - Count, Set, Singleton and Entity CRDTs with merge/apply semantics
//! - Raw entities, references and field values
//! - Storage keys, TTL literals and time sources

pub mod crdt;
pub mod data;
pub mod error;
pub mod storage_key;
pub mod time;
pub mod ttl;
pub mod version;

pub use crdt::{
    CrdtChange, CrdtData, CrdtKind, CrdtModel, CrdtOperation, MergeChanges, ModelChange,
    ModelMergeChanges,
};
pub use data::{FieldName, FieldValue, Primitive, RawEntity, Referencable, Reference, ReferenceId};
pub use error::{CrdtError, Error, Result};
pub use storage_key::StorageKey;
pub use time::{FakeTimeSource, SystemTimeSource, TimeSource};
pub use ttl::Ttl;
pub use version::{Actor, Causality, VersionMap};
