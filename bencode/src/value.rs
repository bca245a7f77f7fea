use std::collections::BTreeMap;
use crate::{Error, Result};

/// A single bencoded value.
///
/// Dictionaries key on raw byte strings; `BTreeMap` keeps them in ascending
/// byte order, which is also the order the encoder must emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(n) => Ok(*n),
            _ => Err(Error::NotA("integer")),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            _ => Err(Error::NotA("byte string")),
        }
    }

    pub fn as_list(&self) -> Result<&[Value]> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(Error::NotA("list")),
        }
    }

    pub fn as_dict(&self) -> Result<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Ok(d),
            _ => Err(Error::NotA("dictionary")),
        }
    }

    /// Optional dictionary lookup.
    pub fn get(&self, key: &str) -> Result<Option<&Value>> {
        Ok(self.as_dict()?.get(key.as_bytes()))
    }

    /// Required dictionary lookup, failing with the key name.
    pub fn require(&self, key: &str) -> Result<&Value> {
        self.get(key)?.ok_or_else(|| Error::MissingKey(key.into()))
    }

    pub fn require_int(&self, key: &str) -> Result<i64> {
        self.require(key)?.as_int().map_err(|_| Error::WrongType {
            key: key.into(),
            expected: "integer",
        })
    }

    pub fn require_bytes(&self, key: &str) -> Result<&[u8]> {
        self.require(key)?.as_bytes().map_err(|_| Error::WrongType {
            key: key.into(),
            expected: "byte string",
        })
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        std::str::from_utf8(self.require_bytes(key)?)
            .map_err(|_| Error::InvalidUtf8 { key: key.into() })
    }

    pub fn require_list(&self, key: &str) -> Result<&[Value]> {
        self.require(key)?.as_list().map_err(|_| Error::WrongType {
            key: key.into(),
            expected: "list",
        })
    }

    pub fn require_dict(&self, key: &str) -> Result<&Value> {
        let v = self.require(key)?;
        v.as_dict().map_err(|_| Error::WrongType {
            key: key.into(),
            expected: "dictionary",
        })?;
        Ok(v)
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key)? {
            Some(v) => v.as_int().map(Some).map_err(|_| Error::WrongType {
                key: key.into(),
                expected: "integer",
            }),
            None => Ok(None),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.get(key)? {
            Some(v) => {
                let b = v.as_bytes().map_err(|_| Error::WrongType {
                    key: key.into(),
                    expected: "byte string",
                })?;
                std::str::from_utf8(b)
                    .map(Some)
                    .map_err(|_| Error::InvalidUtf8 { key: key.into() })
            }
            None => Ok(None),
        }
    }

    pub fn get_list(&self, key: &str) -> Result<Option<&[Value]>> {
        match self.get(key)? {
            Some(v) => v.as_list().map(Some).map_err(|_| Error::WrongType {
                key: key.into(),
                expected: "list",
            }),
            None => Ok(None),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Value {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Value {
        Value::List(l)
    }
}

impl From<BTreeMap<Vec<u8>, Value>> for Value {
    fn from(d: BTreeMap<Vec<u8>, Value>) -> Value {
        Value::Dict(d)
    }
}
