//! Deterministic identities for configured wrappers.
//!
//! A [`WrapperId`] is derived from the wrapped content (source text of a
//! local callable, raw bytes of an external executable) and the call kwargs.
//! Every kwarg pair is digested on its own; the pair digests are sorted and
//! hashed together with the content digest, so kwarg insertion order can
//! never influence the id. The result is rendered in decimal and used as
//! cache key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, WrapperError};

/// Cache key of a configured wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrapperId(String);

impl WrapperId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WrapperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WrapperId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single call kwarg value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KwargValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<KwargValue>),
    /// Bare option without a value (e.g. `-v`).
    Flag,
}

impl KwargValue {
    /// Unescaped command-line tokens for this value.
    pub fn tokens(&self) -> Vec<String> {
        match self {
            KwargValue::Bool(b) => vec![b.to_string()],
            KwargValue::Int(i) => vec![i.to_string()],
            KwargValue::Float(x) => vec![x.to_string()],
            KwargValue::Str(s) => vec![s.clone()],
            KwargValue::List(items) => items.iter().flat_map(|v| v.tokens()).collect(),
            KwargValue::Flag => Vec::new(),
        }
    }

    // Tagged so that e.g. a flag and the string "" never share a digest.
    fn canonical_text(&self) -> String {
        match self {
            KwargValue::Bool(b) => format!("b:{b}"),
            KwargValue::Int(i) => format!("i:{i}"),
            KwargValue::Float(x) => format!("f:{x:?}"),
            KwargValue::Str(s) => format!("s:{s}"),
            KwargValue::List(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.canonical_text()).collect();
                format!("l:[{}]", inner.join(", "))
            }
            KwargValue::Flag => "flag".to_string(),
        }
    }

    fn from_json(key: &str, value: Value) -> Result<Self> {
        Ok(match value {
            Value::Null => KwargValue::Flag,
            Value::Bool(b) => KwargValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    KwargValue::Int(i)
                } else if let Some(x) = n.as_f64() {
                    KwargValue::Float(x)
                } else {
                    return Err(WrapperError::Config(format!(
                        "call kwarg '{key}' has an unrepresentable number: {n}"
                    )));
                }
            }
            Value::String(s) => KwargValue::Str(s),
            Value::Array(items) => KwargValue::List(
                items
                    .into_iter()
                    .map(|v| KwargValue::from_json(key, v))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(_) => {
                return Err(WrapperError::Config(format!(
                    "call kwarg '{key}' must be a scalar or a list, got an object"
                )))
            }
        })
    }
}

impl From<&str> for KwargValue {
    fn from(v: &str) -> Self {
        KwargValue::Str(v.to_string())
    }
}

impl From<String> for KwargValue {
    fn from(v: String) -> Self {
        KwargValue::Str(v)
    }
}

impl From<i64> for KwargValue {
    fn from(v: i64) -> Self {
        KwargValue::Int(v)
    }
}

impl From<i32> for KwargValue {
    fn from(v: i32) -> Self {
        KwargValue::Int(v as i64)
    }
}

impl From<f64> for KwargValue {
    fn from(v: f64) -> Self {
        KwargValue::Float(v)
    }
}

impl From<bool> for KwargValue {
    fn from(v: bool) -> Self {
        KwargValue::Bool(v)
    }
}

impl<T: Into<KwargValue>> From<Vec<T>> for KwargValue {
    fn from(v: Vec<T>) -> Self {
        KwargValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Option name → value mapping passed to a wrapped function or executable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallKwargs(BTreeMap<String, KwargValue>);

impl CallKwargs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<KwargValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn flag(mut self, key: impl Into<String>) -> Self {
        self.0.insert(key.into(), KwargValue::Flag);
        self
    }

    pub fn get(&self, key: &str) -> Option<&KwargValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &KwargValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse kwargs from a JSON document, which must be an object.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| WrapperError::Config(format!("call kwargs are not valid JSON: {err}")))?;
        Self::from_json_value(value)
    }

    pub fn from_json_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(WrapperError::Config(
                "call kwargs must be a mapping (JSON object)".to_string(),
            ));
        };
        let mut out = BTreeMap::new();
        for (k, v) in map {
            let parsed = KwargValue::from_json(&k, v)?;
            out.insert(k, parsed);
        }
        Ok(Self(out))
    }
}

impl<K: Into<String>, V: Into<KwargValue>> FromIterator<(K, V)> for CallKwargs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Derive the identity of `content` called with `kwargs`.
pub fn derive_identity(content: &[u8], kwargs: &CallKwargs) -> WrapperId {
    let mut pair_digests: Vec<[u8; 32]> = kwargs
        .iter()
        .map(|(key, value)| {
            let mut h = Sha256::new();
            h.update((key.len() as u64).to_le_bytes());
            h.update(key.as_bytes());
            h.update(value.canonical_text().as_bytes());
            h.finalize().into()
        })
        .collect();
    pair_digests.sort_unstable();

    let mut h = Sha256::new();
    h.update(Sha256::digest(content));
    for d in &pair_digests {
        h.update(d);
    }
    WrapperId(decimal(&h.finalize().into()))
}

/// Full-width decimal text of a digest: both 128-bit halves, the low half
/// zero padded so distinct digests never render alike.
fn decimal(digest: &[u8; 32]) -> String {
    let mut hi = [0_u8; 16];
    let mut lo = [0_u8; 16];
    hi.copy_from_slice(&digest[..16]);
    lo.copy_from_slice(&digest[16..]);
    format!(
        "{}{:039}",
        u128::from_be_bytes(hi),
        u128::from_be_bytes(lo)
    )
}
