//! Resource identifiers

use super::values::{AttrValue, ResourceRef};
use crate::error::{Error, Result};

/// Name of the hidden attribute carrying an auto-generated identifier
pub const AUTO_ID_ATTR: &str = "auto_id";

/// How instances of a class are identified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierSpec {
    /// Unique across all sessions
    Global(Vec<String>),
    /// Unique within the reporting scannable
    Scoped(Vec<String>),
    /// Fresh opaque identifier generated on creation
    Auto,
}

impl IdentifierSpec {
    pub fn global(fields: &[&str]) -> Self {
        IdentifierSpec::Global(fields.iter().map(|f| f.to_string()).collect())
    }

    pub fn scoped(fields: &[&str]) -> Self {
        IdentifierSpec::Scoped(fields.iter().map(|f| f.to_string()).collect())
    }

    /// Attribute names forming the identifier tuple
    pub fn fields(&self) -> Vec<&str> {
        match self {
            IdentifierSpec::Global(f) | IdentifierSpec::Scoped(f) => {
                f.iter().map(String::as_str).collect()
            }
            IdentifierSpec::Auto => vec![AUTO_ID_ATTR],
        }
    }

    pub fn is_scoped(&self) -> bool {
        matches!(self, IdentifierSpec::Scoped(_))
    }

    pub fn is_global(&self) -> bool {
        !self.is_scoped()
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, IdentifierSpec::Auto)
    }
}

/// Serialize an identifier tuple as a JSON array.
///
/// All reference components must already be resolved to global records.
pub fn id_str(components: &[AttrValue]) -> Result<String> {
    let mut values = Vec::with_capacity(components.len());
    for c in components {
        if let AttrValue::Reference(ResourceRef::Local(h)) = c {
            return Err(Error::Internal(format!(
                "identifier component {} is an unresolved local reference",
                h
            )));
        }
        values.push(c.to_json());
    }
    Ok(serde_json::Value::Array(values).to_string())
}

/// Generate a fresh auto identifier
pub fn new_auto_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// True if `candidate` matches `pattern`, treating `Null` pattern components as wildcards
pub fn compare_id_tuple(pattern: &[AttrValue], candidate: &[AttrValue]) -> bool {
    pattern.len() == candidate.len()
        && pattern
            .iter()
            .zip(candidate)
            .all(|(p, c)| p.is_null() || p == c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordId;
    use crate::metamodel::LocalHandle;

    #[test]
    fn test_id_str_is_exact_json() {
        let tuple = vec![AttrValue::from("S1"), AttrValue::from(RecordId(4)), AttrValue::Integer(2)];
        assert_eq!(id_str(&tuple).unwrap(), "[\"S1\",4,2]");
        assert!(id_str(&[AttrValue::from(LocalHandle(1))]).is_err());
    }

    #[test]
    fn test_compare_id_tuple_wildcards() {
        let candidate = vec![AttrValue::from(1i64), AttrValue::from("/dev/sda")];
        assert!(compare_id_tuple(&[AttrValue::Null, AttrValue::from("/dev/sda")], &candidate));
        assert!(!compare_id_tuple(&[AttrValue::from(2i64), AttrValue::Null], &candidate));
        assert!(!compare_id_tuple(&[AttrValue::Null], &candidate));
    }

    #[test]
    fn test_auto_fields() {
        assert_eq!(IdentifierSpec::Auto.fields(), vec![AUTO_ID_ATTR]);
        assert!(IdentifierSpec::Auto.is_global());
        assert!(IdentifierSpec::scoped(&["path"]).is_scoped());
    }
}
