//! The generic name -> value mapping used as both the in-memory shared
//! state and the on-disk representation of a persistent object's state.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_derive::{Deserialize as DeriveDeserialize, Serialize as DeriveSerialize};

use crate::codec::{decode_ref, encode_file_ref, encode_oid_ref, RefToken};
use crate::oid::Oid;

/// A name -> value mapping. This is what `PersistentClass::to_state` /
/// `from_state` produce and consume, and what gets written verbatim (modulo
/// reference rewriting) into a VERSION log segment.
pub type State = BTreeMap<String, Value>;

/// An attribute value. Recursive containers allow arbitrarily nested
/// structures; `Ref` and `Stream` are the two persistent-reference kinds.
#[derive(Debug, Clone, PartialEq, DeriveSerialize, DeriveDeserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    List(Vec<Value>),
    Map(State),
    Ref(ObjectRef),
    Stream(StreamRef),
}

/// A reference to another persistent object. Encoded on the wire as an
/// `oid://` token (see `codec.rs`), so the serialized form is exactly the
/// identifier-token protocol, not an implementation detail hidden behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub oid: Oid,
    pub class: Option<String>,
}

/// A reference to a byte range within the transaction log, encoded as a
/// `file://` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRef {
    pub offset: u64,
    pub length: u64,
}

impl Serialize for ObjectRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_oid_ref(self.oid, self.class.as_deref()))
    }
}

impl<'de> Deserialize<'de> for ObjectRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TokenVisitor;
        impl<'de> Visitor<'de> for TokenVisitor {
            type Value = ObjectRef;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an oid:// reference token")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<ObjectRef, E> {
                match decode_ref(v).map_err(de::Error::custom)? {
                    RefToken::Oid { oid, class } => Ok(ObjectRef { oid, class }),
                    RefToken::File { .. } => {
                        Err(de::Error::custom("expected an oid:// token, found file://"))
                    }
                }
            }
        }
        deserializer.deserialize_str(TokenVisitor)
    }
}

impl Serialize for StreamRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_file_ref(self.offset, self.length))
    }
}

impl<'de> Deserialize<'de> for StreamRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TokenVisitor;
        impl<'de> Visitor<'de> for TokenVisitor {
            type Value = StreamRef;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a file:// reference token")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<StreamRef, E> {
                match decode_ref(v).map_err(de::Error::custom)? {
                    RefToken::File { offset, length } => Ok(StreamRef { offset, length }),
                    RefToken::Oid { .. } => {
                        Err(de::Error::custom("expected a file:// token, found oid://"))
                    }
                }
            }
        }
        deserializer.deserialize_str(TokenVisitor)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_tree_round_trips_through_bincode() {
        let mut map = State::new();
        map.insert("name".into(), Value::Str("alice".into()));
        map.insert("age".into(), Value::Int(30));
        map.insert(
            "friend".into(),
            Value::Ref(ObjectRef { oid: 9, class: Some("demo::Person".into()) }),
        );
        map.insert("blob".into(), Value::Stream(StreamRef { offset: 100, length: 50 }));
        let value = Value::Map(map);

        let bytes = bincode::serialize(&value).unwrap();
        let back: Value = bincode::deserialize(&bytes).unwrap();
        assert_eq!(value, back);
    }
}
