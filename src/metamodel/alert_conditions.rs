//! Alert conditions evaluated over resource attributes

use super::values::AttrValue;
use serde::{Deserialize, Serialize};

/// Alert severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// What an alert condition checks
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionKind {
    /// Fires when the value is one of the listed states
    Value {
        error_states: Vec<String>,
        warn_states: Vec<String>,
        info_states: Vec<String>,
    },
    /// Fires when the value is strictly above a bound
    UpperBound {
        error_bound: Option<i64>,
        warn_bound: Option<i64>,
        info_bound: Option<i64>,
    },
    /// Fires when the value is strictly below a bound
    LowerBound {
        error_bound: Option<i64>,
        warn_bound: Option<i64>,
        info_bound: Option<i64>,
    },
}

/// An alert condition declared on a resource class
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCondition {
    pub attribute: String,
    pub kind: ConditionKind,
    /// Disambiguates several conditions on one attribute
    pub id: Option<String>,
    pub message: Option<String>,
}

/// Outcome of testing one severity of a condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertTest {
    pub alert_class: String,
    pub attribute: String,
    pub active: bool,
    pub severity: Severity,
}

impl AlertCondition {
    pub fn value(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            kind: ConditionKind::Value {
                error_states: Vec::new(),
                warn_states: Vec::new(),
                info_states: Vec::new(),
            },
            id: None,
            message: None,
        }
    }

    pub fn upper_bound(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            kind: ConditionKind::UpperBound {
                error_bound: None,
                warn_bound: None,
                info_bound: None,
            },
            id: None,
            message: None,
        }
    }

    pub fn lower_bound(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            kind: ConditionKind::LowerBound {
                error_bound: None,
                warn_bound: None,
                info_bound: None,
            },
            id: None,
            message: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn states(mut self, severity: Severity, states: &[&str]) -> Self {
        if let ConditionKind::Value {
            error_states,
            warn_states,
            info_states,
        } = &mut self.kind
        {
            let list = match severity {
                Severity::Error => error_states,
                Severity::Warning => warn_states,
                Severity::Info => info_states,
            };
            *list = states.iter().map(|s| s.to_string()).collect();
        }
        self
    }

    pub fn bound(mut self, severity: Severity, bound: i64) -> Self {
        match &mut self.kind {
            ConditionKind::UpperBound {
                error_bound,
                warn_bound,
                info_bound,
            }
            | ConditionKind::LowerBound {
                error_bound,
                warn_bound,
                info_bound,
            } => {
                let slot = match severity {
                    Severity::Error => error_bound,
                    Severity::Warning => warn_bound,
                    Severity::Info => info_bound,
                };
                *slot = Some(bound);
            }
            ConditionKind::Value { .. } => {}
        }
        self
    }

    /// Alert class raised by this condition when declared on `class_name`
    pub fn alert_class(&self, class_name: &str) -> String {
        format!(
            "{}_{}",
            class_name,
            self.id.as_deref().unwrap_or(&self.attribute)
        )
    }

    /// Test every configured severity against an attribute value
    pub fn test(&self, alert_class: &str, value: &AttrValue) -> Vec<AlertTest> {
        let result = |severity, active| AlertTest {
            alert_class: alert_class.to_string(),
            attribute: self.attribute.clone(),
            active,
            severity,
        };

        match &self.kind {
            ConditionKind::Value {
                error_states,
                warn_states,
                info_states,
            } => {
                let text = match value {
                    AttrValue::Null => None,
                    AttrValue::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                };
                [
                    (Severity::Error, error_states),
                    (Severity::Warning, warn_states),
                    (Severity::Info, info_states),
                ]
                .into_iter()
                .filter(|(_, states)| !states.is_empty())
                .map(|(severity, states)| {
                    let active = text.as_ref().map_or(false, |t| states.contains(t));
                    result(severity, active)
                })
                .collect()
            }
            ConditionKind::UpperBound {
                error_bound,
                warn_bound,
                info_bound,
            } => bounds(error_bound, warn_bound, info_bound)
                .map(|(severity, bound)| {
                    result(severity, value.as_i64().map_or(false, |v| v > bound))
                })
                .collect(),
            ConditionKind::LowerBound {
                error_bound,
                warn_bound,
                info_bound,
            } => bounds(error_bound, warn_bound, info_bound)
                .map(|(severity, bound)| {
                    result(severity, value.as_i64().map_or(false, |v| v < bound))
                })
                .collect(),
        }
    }
}

fn bounds(
    error: &Option<i64>,
    warn: &Option<i64>,
    info: &Option<i64>,
) -> impl Iterator<Item = (Severity, i64)> {
    [
        (Severity::Error, *error),
        (Severity::Warning, *warn),
        (Severity::Info, *info),
    ]
    .into_iter()
    .filter_map(|(s, b)| b.map(|b| (s, b)))
}
