//! Storage keys and their textual grammar
//!
//! Every key renders as `protocol://rest`. Reference-mode keys embed two
//! inner keys, `reference-mode://{backing}{container}`, escaping `{` and `}`
//! in the inner literals by doubling them so nesting round-trips exactly.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const RAMDISK_PROTOCOL: &str = "ramdisk";
pub const VOLATILE_PROTOCOL: &str = "volatile";
pub const DATABASE_PROTOCOL: &str = "db";
pub const FOREIGN_PROTOCOL: &str = "foreign";
pub const REFERENCE_MODE_PROTOCOL: &str = "reference-mode";

/// Address of a store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageKey {
    RamDisk {
        path: String,
    },
    Volatile {
        arc_id: String,
        path: String,
    },
    Database {
        database: String,
        path: String,
    },
    /// Namespace of externally validated ids.
    Foreign {
        namespace: String,
    },
    ReferenceMode {
        backing: Box<StorageKey>,
        storage: Box<StorageKey>,
    },
}

impl StorageKey {
    pub fn ramdisk(path: impl Into<String>) -> Self {
        StorageKey::RamDisk { path: path.into() }
    }

    pub fn volatile(arc_id: impl Into<String>, path: impl Into<String>) -> Self {
        StorageKey::Volatile {
            arc_id: arc_id.into(),
            path: path.into(),
        }
    }

    pub fn database(database: impl Into<String>, path: impl Into<String>) -> Self {
        StorageKey::Database {
            database: database.into(),
            path: path.into(),
        }
    }

    pub fn foreign(namespace: impl Into<String>) -> Self {
        StorageKey::Foreign {
            namespace: namespace.into(),
        }
    }

    pub fn reference_mode(backing: StorageKey, storage: StorageKey) -> Self {
        StorageKey::ReferenceMode {
            backing: Box::new(backing),
            storage: Box::new(storage),
        }
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            StorageKey::RamDisk { .. } => RAMDISK_PROTOCOL,
            StorageKey::Volatile { .. } => VOLATILE_PROTOCOL,
            StorageKey::Database { .. } => DATABASE_PROTOCOL,
            StorageKey::Foreign { .. } => FOREIGN_PROTOCOL,
            StorageKey::ReferenceMode { .. } => REFERENCE_MODE_PROTOCOL,
        }
    }

    pub fn is_reference_mode(&self) -> bool {
        matches!(self, StorageKey::ReferenceMode { .. })
    }

    /// Appends a path component. Reference-mode keys apply it to the
    /// container key.
    pub fn child_with_component(&self, component: &str) -> StorageKey {
        fn join(path: &str, component: &str) -> String {
            if path.is_empty() {
                component.to_string()
            } else {
                format!("{}/{}", path, component)
            }
        }

        match self {
            StorageKey::RamDisk { path } => StorageKey::RamDisk {
                path: join(path, component),
            },
            StorageKey::Volatile { arc_id, path } => StorageKey::Volatile {
                arc_id: arc_id.clone(),
                path: join(path, component),
            },
            StorageKey::Database { database, path } => StorageKey::Database {
                database: database.clone(),
                path: join(path, component),
            },
            StorageKey::Foreign { namespace } => StorageKey::Foreign {
                namespace: join(namespace, component),
            },
            StorageKey::ReferenceMode { backing, storage } => StorageKey::ReferenceMode {
                backing: backing.clone(),
                storage: Box::new(storage.child_with_component(component)),
            },
        }
    }

    /// Parse a key literal.
    pub fn parse(s: &str) -> Result<Self> {
        let (protocol, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::InvalidStorageKey(format!("missing protocol in {:?}", s)))?;

        match protocol {
            RAMDISK_PROTOCOL => Ok(StorageKey::ramdisk(rest)),
            VOLATILE_PROTOCOL => {
                let (arc_id, path) = split_root(s, rest)?;
                Ok(StorageKey::volatile(arc_id, path))
            }
            DATABASE_PROTOCOL => {
                let (database, path) = split_root(s, rest)?;
                Ok(StorageKey::database(database, path))
            }
            FOREIGN_PROTOCOL => {
                if rest.is_empty() {
                    return Err(Error::InvalidStorageKey(format!("empty namespace in {:?}", s)));
                }
                Ok(StorageKey::foreign(rest))
            }
            REFERENCE_MODE_PROTOCOL => {
                let (backing, remainder) = take_component(s, rest)?;
                let (storage, remainder) = take_component(s, remainder)?;
                if !remainder.is_empty() {
                    return Err(Error::InvalidStorageKey(format!(
                        "trailing characters {:?} in {:?}",
                        remainder, s
                    )));
                }
                Ok(StorageKey::reference_mode(
                    StorageKey::parse(&backing)?,
                    StorageKey::parse(&storage)?,
                ))
            }
            other => Err(Error::InvalidStorageKey(format!("unknown protocol {:?}", other))),
        }
    }
}

/// Splits `root/path` where root must be non-empty.
fn split_root<'a>(key: &str, rest: &'a str) -> Result<(&'a str, &'a str)> {
    match rest.split_once('/') {
        Some((root, path)) if !root.is_empty() => Ok((root, path)),
        _ => Err(Error::InvalidStorageKey(format!("expected root/path in {:?}", key))),
    }
}

fn escape(literal: &str) -> String {
    literal.replace('{', "{{").replace('}', "}}")
}

/// Reads one `{...}` component, undoing brace doubling. Returns the
/// unescaped literal and the unconsumed input.
fn take_component<'a>(key: &str, input: &'a str) -> Result<(String, &'a str)> {
    let mut chars = input.char_indices().peekable();
    match chars.next() {
        Some((_, '{')) => {}
        _ => {
            return Err(Error::InvalidStorageKey(format!(
                "expected '{{' at {:?} in {:?}",
                input, key
            )))
        }
    }

    let mut literal = String::new();
    while let Some((idx, c)) = chars.next() {
        match c {
            '{' => match chars.next() {
                Some((_, '{')) => literal.push('{'),
                _ => {
                    return Err(Error::InvalidStorageKey(format!(
                        "unescaped '{{' in {:?}",
                        key
                    )))
                }
            },
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    literal.push('}');
                } else {
                    return Ok((literal, &input[idx + 1..]));
                }
            }
            c => literal.push(c),
        }
    }

    Err(Error::InvalidStorageKey(format!("unterminated component in {:?}", key)))
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKey::RamDisk { path } => write!(f, "{}://{}", RAMDISK_PROTOCOL, path),
            StorageKey::Volatile { arc_id, path } => {
                write!(f, "{}://{}/{}", VOLATILE_PROTOCOL, arc_id, path)
            }
            StorageKey::Database { database, path } => {
                write!(f, "{}://{}/{}", DATABASE_PROTOCOL, database, path)
            }
            StorageKey::Foreign { namespace } => write!(f, "{}://{}", FOREIGN_PROTOCOL, namespace),
            StorageKey::ReferenceMode { backing, storage } => write!(
                f,
                "{}://{{{}}}{{{}}}",
                REFERENCE_MODE_PROTOCOL,
                escape(&backing.to_string()),
                escape(&storage.to_string())
            ),
        }
    }
}

impl FromStr for StorageKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StorageKey::parse(s)
    }
}

impl Serialize for StorageKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StorageKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let literal = String::deserialize(deserializer)?;
        StorageKey::parse(&literal).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(s: &str) {
        let key = StorageKey::parse(s).unwrap();
        assert_eq!(key.to_string(), s);
        assert_eq!(StorageKey::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn test_simple_keys_round_trip() {
        round_trip("ramdisk://people");
        round_trip("ramdisk://");
        round_trip("volatile://arc-1/people/index");
        round_trip("db://main/people");
        round_trip("foreign://accounts");
    }

    #[test]
    fn test_reference_mode_key() {
        let key = StorageKey::reference_mode(
            StorageKey::ramdisk("backing"),
            StorageKey::database("main", "container"),
        );
        assert_eq!(
            key.to_string(),
            "reference-mode://{ramdisk://backing}{db://main/container}"
        );
        round_trip(&key.to_string());
    }

    #[test]
    fn test_nested_reference_mode_key_round_trips() {
        let inner = StorageKey::reference_mode(
            StorageKey::ramdisk("a{b}"),
            StorageKey::volatile("arc", "c}"),
        );
        let outer = StorageKey::reference_mode(inner.clone(), StorageKey::ramdisk("d"));
        let literal = outer.to_string();
        assert_eq!(StorageKey::parse(&literal).unwrap(), outer);
        round_trip(&literal);

        let deeper = StorageKey::reference_mode(StorageKey::ramdisk("x"), outer);
        round_trip(&deeper.to_string());
    }

    #[test]
    fn test_invalid_keys() {
        assert!(StorageKey::parse("people").is_err());
        assert!(StorageKey::parse("nope://x").is_err());
        assert!(StorageKey::parse("volatile://").is_err());
        assert!(StorageKey::parse("reference-mode://{ramdisk://a}").is_err());
        assert!(StorageKey::parse("reference-mode://{ramdisk://a}{ramdisk://b}x").is_err());
    }

    #[test]
    fn test_child_with_component() {
        let key = StorageKey::ramdisk("people");
        assert_eq!(key.child_with_component("p1").to_string(), "ramdisk://people/p1");

        let refmode = StorageKey::reference_mode(StorageKey::ramdisk("b"), StorageKey::ramdisk("c"));
        let child = refmode.child_with_component("x");
        assert_eq!(child.to_string(), "reference-mode://{ramdisk://b}{ramdisk://c/x}");
    }

    #[test]
    fn test_serde_as_string() {
        let key = StorageKey::volatile("arc", "p");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"volatile://arc/p\"");
        assert_eq!(serde_json::from_str::<StorageKey>(&json).unwrap(), key);
    }
}
