//! Resource class builder and compiled class descriptors

use super::alert_conditions::{AlertCondition, AlertTest};
use super::attributes::AttributeSpec;
use super::identifier::{IdentifierSpec, AUTO_ID_ATTR};
use super::relations::Relation;
use super::values::{AttrMap, AttrValue};
use crate::error::{Error, Result};
use crate::store::ClassId;
use indexmap::IndexMap;
use std::collections::HashSet;

/// Custom label for instances of a class
pub type LabelFn = fn(&AttrMap) -> String;

// =============================================================================
// Class Builder
// =============================================================================

/// Declarative description of a resource class.
///
/// Plugins describe classes with a builder and the plugin manager compiles
/// them into immutable [`ResourceClass`] descriptors.
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    name: String,
    label: Option<String>,
    base: Option<String>,
    abstract_class: bool,
    identifier: Option<IdentifierSpec>,
    attributes: Vec<AttributeSpec>,
    relations: Vec<Relation>,
    alert_conditions: Vec<AlertCondition>,
    label_fn: Option<LabelFn>,
}

impl ClassBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            base: None,
            abstract_class: false,
            identifier: None,
            attributes: Vec::new(),
            relations: Vec::new(),
            alert_conditions: Vec::new(),
            label_fn: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Inherit from `base` (`"Class"` or `"module.Class"`)
    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn abstract_class(mut self) -> Self {
        self.abstract_class = true;
        self
    }

    pub fn identifier(mut self, identifier: IdentifierSpec) -> Self {
        self.identifier = Some(identifier);
        self
    }

    pub fn global_id(self, fields: &[&str]) -> Self {
        self.identifier(IdentifierSpec::global(fields))
    }

    pub fn scoped_id(self, fields: &[&str]) -> Self {
        self.identifier(IdentifierSpec::scoped(fields))
    }

    pub fn auto_id(self) -> Self {
        self.identifier(IdentifierSpec::Auto)
    }

    pub fn attribute(mut self, attribute: AttributeSpec) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn alert(mut self, condition: AlertCondition) -> Self {
        self.alert_conditions.push(condition);
        self
    }

    pub fn label_with(mut self, f: LabelFn) -> Self {
        self.label_fn = Some(f);
        self
    }

    /// Compile into a descriptor, merging attributes and conditions from `base`
    pub fn compile(
        &self,
        id: ClassId,
        module: &str,
        base: Option<&ResourceClass>,
    ) -> Result<ResourceClass> {
        let programming = |message: String| Error::ResourceProgramming {
            class_name: self.name.clone(),
            message,
        };

        let mut ancestry = vec![format!("{}.{}", module, self.name)];
        let mut attributes = IndexMap::new();
        let mut alert_conditions = Vec::new();
        let mut identifier = self.identifier.clone();
        let mut label_fn = self.label_fn;

        if let Some(base) = base {
            ancestry.extend(base.ancestry.iter().cloned());
            attributes.extend(
                base.attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            alert_conditions.extend(base.alert_conditions.iter().cloned());
            if identifier.is_none() {
                identifier = base.identifier.clone();
            }
            if label_fn.is_none() {
                label_fn = base.label_fn;
            }
        }

        for attr in &self.attributes {
            attributes.insert(attr.name.clone(), attr.clone());
        }

        if let Some(IdentifierSpec::Auto) = identifier {
            attributes
                .entry(AUTO_ID_ATTR.to_string())
                .or_insert_with(|| AttributeSpec::string(AUTO_ID_ATTR).hidden().user_read_only());
        }

        match &identifier {
            None if !self.abstract_class => {
                return Err(programming("no identifier declared".into()));
            }
            Some(spec) => {
                for field in spec.fields() {
                    if !attributes.contains_key(field) {
                        return Err(programming(format!(
                            "identifier field '{}' is not a declared attribute",
                            field
                        )));
                    }
                }
            }
            None => {}
        }

        for condition in &self.alert_conditions {
            if !attributes.contains_key(&condition.attribute) {
                return Err(programming(format!(
                    "alert condition on unknown attribute '{}'",
                    condition.attribute
                )));
            }
            alert_conditions.push(CompiledCondition {
                alert_class: condition.alert_class(&self.name),
                condition: condition.clone(),
            });
        }

        let mut seen = HashSet::new();
        for compiled in &alert_conditions {
            if !seen.insert(compiled.alert_class.as_str()) {
                return Err(programming(format!(
                    "multiple alert conditions produce '{}'; give each an id",
                    compiled.alert_class
                )));
            }
        }

        Ok(ResourceClass {
            id,
            module: module.to_string(),
            name: self.name.clone(),
            label: self.label.clone().unwrap_or_else(|| self.name.clone()),
            ancestry,
            abstract_class: self.abstract_class,
            identifier,
            attributes,
            relations: self.relations.clone(),
            alert_conditions,
            label_fn,
        })
    }
}

// =============================================================================
// Resource Class
// =============================================================================

/// Alert condition bound to the alert class it raises
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub alert_class: String,
    pub condition: AlertCondition,
}

/// Immutable descriptor of a registered resource class
#[derive(Debug, Clone)]
pub struct ResourceClass {
    pub id: ClassId,
    pub module: String,
    pub name: String,
    pub label: String,
    /// Qualified names of this class and its bases, most derived first
    ancestry: Vec<String>,
    pub abstract_class: bool,
    pub identifier: Option<IdentifierSpec>,
    pub attributes: IndexMap<String, AttributeSpec>,
    /// Relations declared on this class (not inherited)
    pub relations: Vec<Relation>,
    pub alert_conditions: Vec<CompiledCondition>,
    label_fn: Option<LabelFn>,
}

impl ResourceClass {
    pub fn qualified_name(&self) -> &str {
        &self.ancestry[0]
    }

    pub fn ancestry(&self) -> &[String] {
        &self.ancestry
    }

    /// True if this class is, or derives from, the qualified class name
    pub fn is_a(&self, qualified_name: &str) -> bool {
        self.ancestry.iter().any(|a| a == qualified_name)
    }

    pub fn is_scannable(&self) -> bool {
        self.is_a(super::builtin::SCANNABLE_RESOURCE)
    }

    pub fn is_hostside(&self) -> bool {
        self.is_a(super::builtin::HOSTSIDE_RESOURCE)
    }

    pub fn is_scoped(&self) -> bool {
        self.identifier.as_ref().map_or(false, IdentifierSpec::is_scoped)
    }

    pub fn is_global(&self) -> bool {
        !self.is_scoped()
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn attribute(&self, name: &str) -> Result<&AttributeSpec> {
        self.attributes
            .get(name)
            .ok_or_else(|| Error::UnknownAttribute {
                class_name: self.name.clone(),
                attribute: name.to_string(),
            })
    }

    pub fn reference_attributes(&self) -> impl Iterator<Item = &AttributeSpec> {
        self.attributes.values().filter(|a| a.is_reference())
    }

    /// Validate a value for `name`, returning the form to store
    pub fn prepare(&self, name: &str, value: AttrValue) -> Result<AttrValue> {
        self.attribute(name)?.prepare(&self.name, value)
    }

    /// Read an attribute honoring defaults and optional flags
    pub fn read(&self, attrs: &AttrMap, name: &str) -> Result<AttrValue> {
        self.attribute(name)?.read(&self.name, attrs)
    }

    /// Check every mandatory attribute has a value
    pub fn validate(&self, attrs: &AttrMap) -> Result<()> {
        for spec in self.attributes.values() {
            if spec.optional || spec.default.is_some() {
                continue;
            }
            if attrs.get(&spec.name).map_or(true, AttrValue::is_null) {
                return Err(Error::InvalidAttribute {
                    class_name: self.name.clone(),
                    attribute: spec.name.clone(),
                    reason: "mandatory attribute not set".into(),
                });
            }
        }
        Ok(())
    }

    /// Identifier tuple of an instance
    pub fn id_tuple(&self, attrs: &AttrMap) -> Result<Vec<AttrValue>> {
        let identifier = self.identifier.as_ref().ok_or_else(|| Error::ResourceProgramming {
            class_name: self.name.clone(),
            message: "class has no identifier and cannot be instantiated".into(),
        })?;
        identifier
            .fields()
            .into_iter()
            .map(|f| self.read(attrs, f))
            .collect()
    }

    /// Identifier tuple with missing components left as wildcards
    pub fn partial_id_tuple(&self, attrs: &AttrMap) -> Vec<AttrValue> {
        self.identifier
            .as_ref()
            .map(|id| {
                id.fields()
                    .into_iter()
                    .map(|f| attrs.get(f).cloned().unwrap_or(AttrValue::Null))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Display label of an instance
    pub fn instance_label(&self, attrs: &AttrMap) -> String {
        if let Some(f) = self.label_fn {
            return f(attrs);
        }
        let id = self.partial_id_tuple(attrs);
        match id.as_slice() {
            [single] => format!("{} {}", self.label, single),
            many => format!(
                "{} ({})",
                self.label,
                many.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    /// Evaluate every alert condition over an instance's attributes
    pub fn evaluate_alerts(&self, attrs: &AttrMap) -> Vec<AlertTest> {
        self.alert_conditions
            .iter()
            .flat_map(|c| {
                let value = self
                    .read(attrs, &c.condition.attribute)
                    .unwrap_or(AttrValue::Null);
                c.condition.test(&c.alert_class, &value)
            })
            .collect()
    }

    /// Every alert class this class can raise
    pub fn alert_classes(&self) -> Vec<&str> {
        self.alert_conditions
            .iter()
            .map(|c| c.alert_class.as_str())
            .collect()
    }

    /// Decode a JSON attribute object into validated values
    pub fn decode_json_attrs(&self, json: &serde_json::Map<String, serde_json::Value>) -> Result<AttrMap> {
        json.iter()
            .map(|(k, v)| Ok((k.clone(), self.attribute(k)?.decode_json(&self.name, v)?)))
            .collect()
    }
}
