//! Attribute values

use crate::store::RecordId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Plugin-local handle of a resource, unique within one plugin instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalHandle(pub u64);

impl fmt::Display for LocalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Target of a resource reference attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceRef {
    /// Handle within the reporting plugin instance
    Local(LocalHandle),
    /// Persisted record, e.g. one reported by another plugin
    Global(RecordId),
}

/// A typed attribute value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Integer(i64),
    String(String),
    Reference(ResourceRef),
}

/// Attribute name to value
pub type AttrMap = BTreeMap<String, AttrValue>;

impl AttrValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<ResourceRef> {
        match self {
            AttrValue::Reference(r) => Some(*r),
            _ => None,
        }
    }

    /// Persisted record this value points at, if it is a global reference
    pub fn as_record(&self) -> Option<RecordId> {
        match self {
            AttrValue::Reference(ResourceRef::Global(id)) => Some(*id),
            _ => None,
        }
    }

    /// JSON form used for serialized attribute rows and identifier tuples
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::Null => serde_json::Value::Null,
            AttrValue::Bool(b) => serde_json::Value::Bool(*b),
            AttrValue::Integer(i) => serde_json::Value::from(*i),
            AttrValue::String(s) => serde_json::Value::String(s.clone()),
            AttrValue::Reference(ResourceRef::Global(id)) => serde_json::Value::from(id.0),
            AttrValue::Reference(ResourceRef::Local(h)) => {
                serde_json::json!({ "local": h.0 })
            }
        }
    }

    /// Decode a serialized attribute row
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AttrValue::Null,
            serde_json::Value::Bool(b) => AttrValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => AttrValue::Integer(i),
                None => AttrValue::String(n.to_string()),
            },
            serde_json::Value::String(s) => AttrValue::String(s.clone()),
            other => AttrValue::String(other.to_string()),
        }
    }

    /// Lower-cased copy for case-insensitive matching
    pub fn to_lowercase(&self) -> Self {
        match self {
            AttrValue::String(s) => AttrValue::String(s.to_lowercase()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Null => write!(f, "None"),
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Integer(i) => write!(f, "{}", i),
            AttrValue::String(s) => write!(f, "{}", s),
            AttrValue::Reference(ResourceRef::Local(h)) => write!(f, "{}", h),
            AttrValue::Reference(ResourceRef::Global(id)) => write!(f, "{}", id),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<&String> for AttrValue {
    fn from(s: &String) -> Self {
        AttrValue::String(s.clone())
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Integer(i)
    }
}

impl From<i32> for AttrValue {
    fn from(i: i32) -> Self {
        AttrValue::Integer(i64::from(i))
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

impl From<LocalHandle> for AttrValue {
    fn from(h: LocalHandle) -> Self {
        AttrValue::Reference(ResourceRef::Local(h))
    }
}

impl From<RecordId> for AttrValue {
    fn from(id: RecordId) -> Self {
        AttrValue::Reference(ResourceRef::Global(id))
    }
}

impl<T: Into<AttrValue>> From<Option<T>> for AttrValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(AttrValue::Null)
    }
}

/// Build an [`AttrMap`] from `name => value` pairs
#[macro_export]
macro_rules! attrs {
    () => { $crate::metamodel::AttrMap::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::metamodel::AttrMap::new();
        $( map.insert($key.to_string(), $crate::metamodel::AttrValue::from($value)); )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_forms() {
        assert_eq!(AttrValue::from("S1").to_json(), serde_json::json!("S1"));
        assert_eq!(AttrValue::from(RecordId(9)).to_json(), serde_json::json!(9));
        assert_eq!(
            AttrValue::from_json(&serde_json::json!(4096)),
            AttrValue::Integer(4096)
        );
        assert_eq!(AttrValue::from_json(&serde_json::Value::Null), AttrValue::Null);
    }

    #[test]
    fn test_attrs_macro() {
        let map = attrs! { "serial" => "S1", "size" => 4096i64, "host_id" => None::<i64> };
        assert_eq!(map["serial"], AttrValue::String("S1".into()));
        assert_eq!(map["size"].as_i64(), Some(4096));
        assert!(map["host_id"].is_null());
    }
}
