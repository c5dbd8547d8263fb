//! Typed attribute descriptors

use super::values::{AttrMap, AttrValue};
use crate::error::{Error, Result};

/// Callback turning a plaintext password into its stored form
pub type EncryptFn = fn(&str) -> String;

/// Computed default derived from the other attributes of a resource
pub type DefaultFn = fn(&AttrMap) -> AttrValue;

/// Value type of an attribute
#[derive(Debug, Clone)]
pub enum AttributeType {
    String { max_length: Option<usize> },
    Integer { min: Option<i64>, max: Option<i64> },
    /// Size in bytes
    Bytes,
    Boolean,
    Enum(Vec<String>),
    Uuid,
    PosixPath,
    Hostname,
    ResourceReference,
    Password { encrypt: EncryptFn },
}

impl AttributeType {
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeType::String { .. } => "String",
            AttributeType::Integer { .. } => "Integer",
            AttributeType::Bytes => "Bytes",
            AttributeType::Boolean => "Boolean",
            AttributeType::Enum(_) => "Enum",
            AttributeType::Uuid => "Uuid",
            AttributeType::PosixPath => "PosixPath",
            AttributeType::Hostname => "Hostname",
            AttributeType::ResourceReference => "ResourceReference",
            AttributeType::Password { .. } => "Password",
        }
    }
}

/// Default value of an attribute
#[derive(Debug, Clone)]
pub enum AttrDefault {
    Value(AttrValue),
    Computed(DefaultFn),
}

/// Descriptor of one attribute on a resource class
#[derive(Debug, Clone)]
pub struct AttributeSpec {
    pub name: String,
    pub kind: AttributeType,
    pub label: Option<String>,
    pub optional: bool,
    pub hidden: bool,
    pub user_read_only: bool,
    pub default: Option<AttrDefault>,
}

impl AttributeSpec {
    pub fn new(name: impl Into<String>, kind: AttributeType) -> Self {
        Self {
            name: name.into(),
            kind,
            label: None,
            optional: false,
            hidden: false,
            user_read_only: false,
            default: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::String { max_length: None })
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::Integer { min: None, max: None })
    }

    pub fn bounded_integer(name: impl Into<String>, min: Option<i64>, max: Option<i64>) -> Self {
        Self::new(name, AttributeType::Integer { min, max })
    }

    pub fn bytes(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::Bytes)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::Boolean)
    }

    pub fn enumeration(name: impl Into<String>, options: &[&str]) -> Self {
        Self::new(
            name,
            AttributeType::Enum(options.iter().map(|o| o.to_string()).collect()),
        )
    }

    pub fn uuid(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::Uuid)
    }

    pub fn posix_path(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::PosixPath)
    }

    pub fn hostname(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::Hostname)
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::ResourceReference)
    }

    pub fn password(name: impl Into<String>, encrypt: EncryptFn) -> Self {
        Self::new(name, AttributeType::Password { encrypt })
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        if let AttributeType::String { max_length: m } = &mut self.kind {
            *m = Some(max_length);
        }
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn user_read_only(mut self) -> Self {
        self.user_read_only = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<AttrValue>) -> Self {
        self.default = Some(AttrDefault::Value(value.into()));
        self
    }

    pub fn default_fn(mut self, f: DefaultFn) -> Self {
        self.default = Some(AttrDefault::Computed(f));
        self
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, AttributeType::ResourceReference)
    }

    /// Human readable label, derived from the name when not given
    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.name.replace('_', " "))
    }

    /// Validate a value, returning the form that should be stored
    pub fn prepare(&self, class_name: &str, value: AttrValue) -> Result<AttrValue> {
        let invalid = |reason: String| Error::InvalidAttribute {
            class_name: class_name.to_string(),
            attribute: self.name.clone(),
            reason,
        };

        if value.is_null() {
            return if self.optional || self.default.is_some() {
                Ok(value)
            } else {
                Err(invalid("value is required".into()))
            };
        }

        match (&self.kind, value) {
            (AttributeType::String { max_length }, AttrValue::String(s)) => {
                if let Some(max) = max_length {
                    if s.chars().count() > *max {
                        return Err(invalid(format!("longer than {} characters", max)));
                    }
                }
                Ok(AttrValue::String(s))
            }
            (AttributeType::Integer { min, max }, AttrValue::Integer(i)) => {
                if let Some(min) = min {
                    if i < *min {
                        return Err(invalid(format!("{} is below minimum {}", i, min)));
                    }
                }
                if let Some(max) = max {
                    if i > *max {
                        return Err(invalid(format!("{} is above maximum {}", i, max)));
                    }
                }
                Ok(AttrValue::Integer(i))
            }
            (AttributeType::Bytes, AttrValue::Integer(i)) => {
                if i < 0 {
                    return Err(invalid(format!("negative size {}", i)));
                }
                Ok(AttrValue::Integer(i))
            }
            (AttributeType::Boolean, AttrValue::Bool(b)) => Ok(AttrValue::Bool(b)),
            (AttributeType::Enum(options), AttrValue::String(s)) => {
                if options.iter().any(|o| *o == s) {
                    Ok(AttrValue::String(s))
                } else {
                    Err(invalid(format!("'{}' not in {:?}", s, options)))
                }
            }
            (AttributeType::Uuid, AttrValue::String(s)) => match uuid::Uuid::parse_str(&s) {
                Ok(_) => Ok(AttrValue::String(s)),
                Err(e) => Err(invalid(format!("bad uuid '{}': {}", s, e))),
            },
            (AttributeType::PosixPath, AttrValue::String(s)) => {
                if s.is_empty() || s.contains('\0') {
                    Err(invalid(format!("bad path '{}'", s)))
                } else {
                    Ok(AttrValue::String(s))
                }
            }
            (AttributeType::Hostname, AttrValue::String(s)) => {
                if is_valid_hostname(&s) {
                    Ok(AttrValue::String(s))
                } else {
                    Err(invalid(format!("bad hostname '{}'", s)))
                }
            }
            (AttributeType::ResourceReference, AttrValue::Reference(r)) => {
                Ok(AttrValue::Reference(r))
            }
            (AttributeType::Password { encrypt }, AttrValue::String(s)) => {
                Ok(AttrValue::String(encrypt(&s)))
            }
            (kind, other) => Err(invalid(format!(
                "expected {}, got {:?}",
                kind.type_name(),
                other
            ))),
        }
    }

    /// Read this attribute from a stored map, falling back to the default
    pub fn read(&self, class_name: &str, attrs: &AttrMap) -> Result<AttrValue> {
        if let Some(value) = attrs.get(&self.name) {
            if !value.is_null() || self.optional {
                return Ok(value.clone());
            }
        }
        match &self.default {
            Some(AttrDefault::Value(v)) => Ok(v.clone()),
            Some(AttrDefault::Computed(f)) => Ok(f(attrs)),
            None if self.optional => Ok(AttrValue::Null),
            None => Err(Error::InvalidAttribute {
                class_name: class_name.to_string(),
                attribute: self.name.clone(),
                reason: "attribute has not been set".into(),
            }),
        }
    }

    /// Decode a JSON value (e.g. from the control RPC) into this attribute's type
    pub fn decode_json(&self, class_name: &str, value: &serde_json::Value) -> Result<AttrValue> {
        let decoded = match (&self.kind, value) {
            (AttributeType::ResourceReference, serde_json::Value::Number(n)) => n
                .as_u64()
                .map(|id| AttrValue::from(crate::store::RecordId(id)))
                .unwrap_or(AttrValue::Null),
            (_, v) => AttrValue::from_json(v),
        };
        self.prepare(class_name, decoded)
    }
}

fn is_valid_hostname(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use assert_matches::assert_matches;

    fn rot13(s: &str) -> String {
        s.chars()
            .map(|c| match c {
                'a'..='z' => (((c as u8 - b'a') + 13) % 26 + b'a') as char,
                'A'..='Z' => (((c as u8 - b'A') + 13) % 26 + b'A') as char,
                _ => c,
            })
            .collect()
    }

    #[test]
    fn test_prepare_validates_types() {
        let size = AttributeSpec::bytes("size");
        assert_eq!(size.prepare("Lun", 10.into()).unwrap(), AttrValue::Integer(10));
        assert_matches!(
            size.prepare("Lun", (-1).into()),
            Err(Error::InvalidAttribute { .. })
        );
        assert_matches!(
            size.prepare("Lun", "big".into()),
            Err(Error::InvalidAttribute { .. })
        );

        let state = AttributeSpec::enumeration("state", &["up", "down"]);
        assert!(state.prepare("Nic", "up".into()).is_ok());
        assert!(state.prepare("Nic", "sideways".into()).is_err());

        let name = AttributeSpec::string("name").max_length(3);
        assert!(name.prepare("Nic", "eth0".into()).is_err());

        let host = AttributeSpec::hostname("address");
        assert!(host.prepare("Controller", "ctrl-1.example.com".into()).is_ok());
        assert!(host.prepare("Controller", "-bad".into()).is_err());
    }

    #[test]
    fn test_password_is_encrypted() {
        let password = AttributeSpec::password("password", rot13);
        assert_eq!(
            password.prepare("Controller", "secret".into()).unwrap(),
            AttrValue::String("frperg".into())
        );
    }

    #[test]
    fn test_read_defaults() {
        fn doubled(attrs: &AttrMap) -> AttrValue {
            AttrValue::Integer(attrs.get("size").and_then(AttrValue::as_i64).unwrap_or(0) * 2)
        }

        let attrs = attrs! { "size" => 21i64 };
        let fixed = AttributeSpec::boolean("usable").default_value(true);
        let computed = AttributeSpec::integer("double").default_fn(doubled);
        let optional = AttributeSpec::string("fs").optional();
        let required = AttributeSpec::string("serial");

        assert_eq!(fixed.read("Lun", &attrs).unwrap(), AttrValue::Bool(true));
        assert_eq!(computed.read("Lun", &attrs).unwrap(), AttrValue::Integer(42));
        assert_eq!(optional.read("Lun", &attrs).unwrap(), AttrValue::Null);
        assert_matches!(
            required.read("Lun", &attrs),
            Err(Error::InvalidAttribute { .. })
        );
    }
}
