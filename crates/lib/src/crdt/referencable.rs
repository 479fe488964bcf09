//! Identifiable values stored inside CRDT collections.
//!
//! Collections key their elements by a [`ReferenceId`]. Anything stored in a
//! [`CrdtSet`](crate::crdt::CrdtSet) or [`CrdtSingleton`](crate::crdt::CrdtSingleton)
//! implements [`Referencable`]. [`Primitive`] covers the scalar field values
//! held by entities.

use std::fmt::{self, Debug};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

use crate::crdt::CRDTError;

/// Identifier of an element within a collection.
pub type ReferenceId = String;

/// A value with a stable identifier.
pub trait Referencable:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn id(&self) -> ReferenceId;
}

/// SHA-256 digest of the value's canonical JSON encoding.
///
/// Used to pick a winner between two concurrent values stored under the same
/// id: the value with the lower digest wins on every replica.
pub fn content_hash<T: Serialize>(value: &T) -> Result<[u8; 32], CRDTError> {
    let bytes = serde_json::to_vec(value).map_err(|e| CRDTError::Serialization {
        reason: e.to_string(),
    })?;
    Ok(Sha256::digest(&bytes).into())
}

/// Scalar field value.
///
/// The id of a primitive encodes both its kind and its value, so equal ids
/// always mean equal values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Primitive {
    Text(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl Referencable for Primitive {
    fn id(&self) -> ReferenceId {
        match self {
            Primitive::Text(s) => format!("Primitive<Text>({s})"),
            Primitive::Int(i) => format!("Primitive<Int>({i})"),
            Primitive::Bool(b) => format!("Primitive<Bool>({b})"),
            Primitive::Bytes(b) => format!("Primitive<Bytes>({})", hex::encode(b)),
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::Text(s) => write!(f, "{s}"),
            Primitive::Int(i) => write!(f, "{i}"),
            Primitive::Bool(b) => write!(f, "{b}"),
            Primitive::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

impl From<&str> for Primitive {
    fn from(s: &str) -> Self {
        Primitive::Text(s.to_string())
    }
}

impl From<String> for Primitive {
    fn from(s: String) -> Self {
        Primitive::Text(s)
    }
}

impl From<i64> for Primitive {
    fn from(i: i64) -> Self {
        Primitive::Int(i)
    }
}

impl From<bool> for Primitive {
    fn from(b: bool) -> Self {
        Primitive::Bool(b)
    }
}

impl From<Vec<u8>> for Primitive {
    fn from(b: Vec<u8>) -> Self {
        Primitive::Bytes(b)
    }
}
