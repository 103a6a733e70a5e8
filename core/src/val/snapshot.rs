use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use super::{ErrorKind, ErrorObject, PlainObject, Property, Val};

/// Nesting beyond this is treated as a cycle.
const MAX_SNAPSHOT_DEPTH: usize = 64;

/// Plain-data image of a value, used to persist suspended generators.
///
/// Functions, generators, and accessor properties have no plain-data form and are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SnapshotValue {
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    Float(f64),
    Str(String),
    Array(Vec<SnapshotValue>),
    Object(Vec<(String, SnapshotValue)>),
    Error { kind: ErrorKind, message: String },
}

impl SnapshotValue {
    pub fn capture(value: &Val) -> Result<Self> {
        Self::capture_at(value, 0)
    }

    fn capture_at(value: &Val, depth: usize) -> Result<Self> {
        if depth > MAX_SNAPSHOT_DEPTH {
            bail!("value nests deeper than {MAX_SNAPSHOT_DEPTH} levels (cyclic?)");
        }
        Ok(match value {
            Val::Undefined => SnapshotValue::Undefined,
            Val::Null => SnapshotValue::Null,
            Val::Bool(b) => SnapshotValue::Bool(*b),
            Val::Int(i) => SnapshotValue::Int(*i),
            Val::Float(x) => SnapshotValue::Float(*x),
            Val::Str(s) => SnapshotValue::Str(s.to_string()),
            Val::Array(a) => SnapshotValue::Array(
                a.to_vec()
                    .iter()
                    .map(|item| Self::capture_at(item, depth + 1))
                    .collect::<Result<_>>()?,
            ),
            Val::Object(o) => {
                let entries = o.data_entries();
                if entries.len() != o.len() {
                    bail!("objects with accessor properties cannot be snapshotted");
                }
                SnapshotValue::Object(
                    entries
                        .iter()
                        .map(|(k, v)| Ok((k.to_string(), Self::capture_at(v, depth + 1)?)))
                        .collect::<Result<_>>()?,
                )
            }
            Val::Error(e) => SnapshotValue::Error {
                kind: e.kind,
                message: e.message.to_string(),
            },
            Val::Closure(_) | Val::Native(_) | Val::Generator(_) => {
                bail!("{} values cannot be snapshotted", value.type_name())
            }
        })
    }

    pub fn restore(&self) -> Val {
        match self {
            SnapshotValue::Undefined => Val::Undefined,
            SnapshotValue::Null => Val::Null,
            SnapshotValue::Bool(b) => Val::Bool(*b),
            SnapshotValue::Int(i) => Val::Int(*i),
            SnapshotValue::Float(x) => Val::Float(*x),
            SnapshotValue::Str(s) => Val::str(s),
            SnapshotValue::Array(items) => Val::array(items.iter().map(SnapshotValue::restore).collect()),
            SnapshotValue::Object(entries) => {
                let obj = PlainObject::new();
                for (k, v) in entries {
                    obj.set_own(k, v.restore());
                }
                Val::Object(obj)
            }
            SnapshotValue::Error { kind, message } => Val::Error(ErrorObject::new(*kind, message)),
        }
    }
}
