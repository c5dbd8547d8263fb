//! Provide/Subscribe relations

use super::values::{AttrMap, AttrValue};

/// Relation declared on a resource class
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// Instances of this class become parents of matching `target` instances
    Provide {
        target: String,
        attributes: Vec<String>,
        ignorecase: bool,
    },
    /// Matching `target` instances become parents of instances of this class
    Subscribe {
        target: String,
        attributes: Vec<String>,
        ignorecase: bool,
    },
}

impl Relation {
    pub fn provide(target: impl Into<String>, attributes: &[&str]) -> Self {
        Relation::Provide {
            target: target.into(),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            ignorecase: false,
        }
    }

    pub fn subscribe(target: impl Into<String>, attributes: &[&str]) -> Self {
        Relation::Subscribe {
            target: target.into(),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            ignorecase: false,
        }
    }

    /// Compare string values case-insensitively
    pub fn ignorecase(mut self) -> Self {
        match &mut self {
            Relation::Provide { ignorecase, .. } | Relation::Subscribe { ignorecase, .. } => {
                *ignorecase = true
            }
        }
        self
    }

    pub fn target(&self) -> &str {
        match self {
            Relation::Provide { target, .. } | Relation::Subscribe { target, .. } => target,
        }
    }

    pub fn attributes(&self) -> &[String] {
        match self {
            Relation::Provide { attributes, .. } | Relation::Subscribe { attributes, .. } => {
                attributes
            }
        }
    }
}

/// A resolved subscription: subscribers of `key` get every instance of
/// `subscribe_to` with equal attribute values as a parent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub key: String,
    /// Qualified name of the providing class
    pub subscribe_to: String,
    pub attributes: Vec<String>,
    pub ignorecase: bool,
}

impl Subscription {
    pub fn new(subscribe_to: impl Into<String>, attributes: Vec<String>, ignorecase: bool) -> Self {
        let subscribe_to = subscribe_to.into();
        Self {
            key: format!("{}:{}", subscribe_to, attributes.join(",")),
            subscribe_to,
            attributes,
            ignorecase,
        }
    }

    /// Values compared when matching providers to subscribers
    pub fn value(&self, attrs: &AttrMap) -> Vec<AttrValue> {
        self.attributes
            .iter()
            .map(|a| {
                let v = attrs.get(a).cloned().unwrap_or(AttrValue::Null);
                if self.ignorecase {
                    v.to_lowercase()
                } else {
                    v
                }
            })
            .collect()
    }
}
