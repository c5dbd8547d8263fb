//! Per-plugin resource index

use crate::error::{Error, Result};
use crate::metamodel::{compare_id_tuple, AttrMap, AttrValue, LocalHandle, ResourceClass};
use crate::store::ClassId;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;

/// A resource as pushed to the resource manager
#[derive(Debug, Clone)]
pub struct ReportedResource {
    pub handle: LocalHandle,
    pub class: Arc<ResourceClass>,
    pub attributes: AttrMap,
    pub parents: Vec<LocalHandle>,
}

// =============================================================================
// Local Resource
// =============================================================================

/// A live resource owned by a plugin instance
#[derive(Debug, Clone)]
pub struct LocalResource {
    handle: LocalHandle,
    class: Arc<ResourceClass>,
    attributes: AttrMap,
    parents: Vec<LocalHandle>,
    delta_attrs: AttrMap,
    delta_parents: Vec<LocalHandle>,
    calc_changes_delta: bool,
}

impl LocalResource {
    pub(crate) fn new(
        handle: LocalHandle,
        class: Arc<ResourceClass>,
        attributes: AttrMap,
        parents: Vec<LocalHandle>,
        calc_changes_delta: bool,
    ) -> Self {
        Self {
            handle,
            class,
            attributes,
            parents,
            delta_attrs: AttrMap::new(),
            delta_parents: Vec::new(),
            calc_changes_delta,
        }
    }

    pub fn handle(&self) -> LocalHandle {
        self.handle
    }

    pub fn class(&self) -> &Arc<ResourceClass> {
        &self.class
    }

    /// Explicitly set attributes
    pub fn attributes(&self) -> &AttrMap {
        &self.attributes
    }

    pub fn parents(&self) -> &[LocalHandle] {
        &self.parents
    }

    /// Read an attribute, falling back to its default
    pub fn get(&self, name: &str) -> Result<AttrValue> {
        self.class.read(&self.attributes, name)
    }

    pub fn id_tuple(&self) -> Result<Vec<AttrValue>> {
        self.class.id_tuple(&self.attributes)
    }

    pub fn label(&self) -> String {
        self.class.instance_label(&self.attributes)
    }

    /// Store an already validated value, recording a delta if it changed
    pub(crate) fn set_prepared(&mut self, name: &str, value: AttrValue) {
        let changed = self.attributes.get(name) != Some(&value);
        if changed || !self.calc_changes_delta {
            self.delta_attrs.insert(name.to_string(), value.clone());
        }
        self.attributes.insert(name.to_string(), value);
    }

    pub(crate) fn add_parent(&mut self, parent: LocalHandle) {
        if !self.parents.contains(&parent) {
            self.parents.push(parent);
            self.delta_parents.push(parent);
        }
    }

    pub(crate) fn remove_parent(&mut self, parent: LocalHandle) {
        if let Some(pos) = self.parents.iter().position(|p| *p == parent) {
            self.parents.remove(pos);
            self.delta_parents.push(parent);
        }
    }

    /// Take and reset the accumulated attribute and parent deltas
    pub(crate) fn take_deltas(&mut self) -> (AttrMap, Vec<LocalHandle>) {
        let mut parents = std::mem::take(&mut self.delta_parents);
        parents.dedup();
        (std::mem::take(&mut self.delta_attrs), parents)
    }

    pub fn report(&self) -> ReportedResource {
        ReportedResource {
            handle: self.handle,
            class: self.class.clone(),
            attributes: self.attributes.clone(),
            parents: self.parents.clone(),
        }
    }
}

// =============================================================================
// Resource Index
// =============================================================================

/// Resources of one plugin instance, by handle and by identity
#[derive(Debug, Default)]
pub struct ResourceIndex {
    resources: IndexMap<LocalHandle, LocalResource>,
    by_identity: HashMap<(ClassId, Vec<AttrValue>), LocalHandle>,
}

impl ResourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn contains(&self, handle: LocalHandle) -> bool {
        self.resources.contains_key(&handle)
    }

    /// Add a resource; its (class, identifier) must not be indexed yet
    pub fn add(&mut self, resource: LocalResource) -> Result<()> {
        let id_tuple = resource.id_tuple()?;
        let key = (resource.class.id, id_tuple);
        if self.by_identity.contains_key(&key) {
            return Err(Error::DuplicateResource {
                class_name: resource.class.name.clone(),
                id: format!("{:?}", key.1),
            });
        }
        self.by_identity.insert(key, resource.handle);
        self.resources.insert(resource.handle, resource);
        Ok(())
    }

    pub fn remove(&mut self, handle: LocalHandle) -> Option<LocalResource> {
        let resource = self.resources.shift_remove(&handle)?;
        self.by_identity.retain(|_, h| *h != handle);
        Some(resource)
    }

    /// Look up by exact class and identifier tuple
    pub fn get(&self, class: &ResourceClass, id_tuple: &[AttrValue]) -> Result<LocalHandle> {
        self.by_identity
            .get(&(class.id, id_tuple.to_vec()))
            .copied()
            .ok_or_else(|| Error::ResourceNotFound {
                class_name: class.name.clone(),
                id: format!("{:?}", id_tuple),
            })
    }

    /// Resources of exactly `class` whose identifier matches the given
    /// attributes, with missing identifier components as wildcards
    pub fn find_by_attr(&self, class: &ResourceClass, attrs: &AttrMap) -> Vec<LocalHandle> {
        let pattern = class.partial_id_tuple(attrs);
        self.resources
            .values()
            .filter(|r| r.class.id == class.id)
            .filter(|r| {
                r.id_tuple()
                    .map(|t| compare_id_tuple(&pattern, &t))
                    .unwrap_or(false)
            })
            .map(|r| r.handle)
            .collect()
    }

    pub fn resource(&self, handle: LocalHandle) -> Option<&LocalResource> {
        self.resources.get(&handle)
    }

    /// Set an attribute and re-key the identity index if the identifier changed
    pub(crate) fn set_attribute(
        &mut self,
        handle: LocalHandle,
        name: &str,
        value: AttrValue,
    ) -> Result<()> {
        let resource = self
            .resources
            .get_mut(&handle)
            .ok_or_else(|| Error::Internal(format!("no local resource {}", handle)))?;
        let before = resource.id_tuple().ok();
        resource.set_prepared(name, value);
        let after = resource.id_tuple().ok();
        if before != after {
            let class_id = resource.class.id;
            self.by_identity.retain(|_, h| *h != handle);
            if let Some(id) = after {
                self.by_identity.insert((class_id, id), handle);
            }
        }
        Ok(())
    }

    pub(crate) fn resource_mut(&mut self, handle: LocalHandle) -> Option<&mut LocalResource> {
        self.resources.get_mut(&handle)
    }

    pub fn all(&self) -> impl Iterator<Item = &LocalResource> {
        self.resources.values()
    }

    pub(crate) fn all_mut(&mut self) -> impl Iterator<Item = &mut LocalResource> {
        self.resources.values_mut()
    }

    pub fn handles(&self) -> Vec<LocalHandle> {
        self.resources.keys().copied().collect()
    }
}
