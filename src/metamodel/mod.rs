//! Resource Metamodel
//!
//! Declarative resource classes: typed attributes, identifiers, relations
//! and alert conditions. Classes are described with [`ClassBuilder`] and
//! compiled into immutable [`ResourceClass`] descriptors at plugin load.

mod alert_conditions;
mod attributes;
pub mod builtin;
mod class;
mod identifier;
mod relations;
mod values;

pub use alert_conditions::{AlertCondition, AlertTest, ConditionKind, Severity};
pub use attributes::{AttrDefault, AttributeSpec, AttributeType, DefaultFn, EncryptFn};
pub use class::{ClassBuilder, CompiledCondition, LabelFn, ResourceClass};
pub use identifier::{compare_id_tuple, id_str, new_auto_id, IdentifierSpec, AUTO_ID_ATTR};
pub use relations::{Relation, Subscription};
pub use values::{AttrMap, AttrValue, LocalHandle, ResourceRef};
