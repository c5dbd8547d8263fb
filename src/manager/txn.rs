//! Transaction context shared by the manager entry points

use super::events::ResourceEvent;
use super::indices::{ManagerState, Session, SessionKey};
use crate::error::{Error, Result};
use crate::jobs::JobScheduler;
use crate::metamodel::{AttrMap, AttrValue, LocalHandle, ResourceClass, ResourceRef};
use crate::plugin::ClassRegistry;
use crate::store::{RecordId, Tables};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Working copies of the manager state and the store tables for one
/// entry point. Dropped without commit on error.
pub(crate) struct Txn<'a> {
    pub registry: &'a ClassRegistry,
    pub jobs: &'a dyn JobScheduler,
    pub state: &'a mut ManagerState,
    pub tables: &'a mut Tables,
    pub events: Vec<ResourceEvent>,
}

impl<'a> Txn<'a> {
    pub fn new(
        registry: &'a ClassRegistry,
        jobs: &'a dyn JobScheduler,
        state: &'a mut ManagerState,
        tables: &'a mut Tables,
    ) -> Self {
        Self {
            registry,
            jobs,
            state,
            tables,
            events: Vec::new(),
        }
    }

    pub fn emit(&mut self, event: ResourceEvent) {
        self.events.push(event);
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    pub fn session(&self, key: &SessionKey) -> Result<&Session> {
        match self.state.sessions.get(&key.scannable_id) {
            Some(s) if s.epoch == key.epoch => Ok(s),
            _ => {
                warn!(scannable = %key.scannable_id, "Rejecting operation on stale session");
                Err(Error::SessionStale {
                    scannable_id: key.scannable_id,
                })
            }
        }
    }

    pub fn session_mut(&mut self, key: &SessionKey) -> Result<&mut Session> {
        self.session(key)?;
        self.state
            .sessions
            .get_mut(&key.scannable_id)
            .ok_or(Error::SessionStale {
                scannable_id: key.scannable_id,
            })
    }

    pub fn global_id(&self, key: &SessionKey, handle: LocalHandle) -> Result<Option<RecordId>> {
        Ok(self.session(key)?.local_to_global.get(&handle).copied())
    }

    /// Replace local references with the global ids mapped in the session
    pub fn globalize(&self, key: &SessionKey, attrs: &AttrMap) -> Result<AttrMap> {
        let session = self.session(key)?;
        attrs
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    AttrValue::Reference(ResourceRef::Local(h)) => {
                        let id = session.local_to_global.get(h).ok_or_else(|| {
                            Error::Internal(format!(
                                "attribute {} references {} which is not in session {}",
                                k, h, key.scannable_id
                            ))
                        })?;
                        AttrValue::Reference(ResourceRef::Global(*id))
                    }
                    other => other.clone(),
                };
                Ok((k.clone(), v))
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    /// Resource class of a record, filling the class index from the store on miss
    pub fn class_of(&mut self, record: RecordId) -> Result<Arc<ResourceClass>> {
        let class_id = match self.state.class_index.get(&record) {
            Some(id) => *id,
            None => {
                let id = self
                    .tables
                    .record(record)
                    .ok_or(Error::RecordNotFound { record_id: record })?
                    .class_id;
                self.state.class_index.insert(record, id);
                id
            }
        };
        self.registry
            .get(class_id)
            .cloned()
            .ok_or_else(|| Error::PluginNotFound(format!("resource class {}", class_id)))
    }

    /// Decoded attributes of a stored record
    pub fn record_attrs(&self, record: RecordId) -> AttrMap {
        decode_attrs(self.tables, record)
    }

    /// Read one attribute with class defaults applied
    pub fn read_attr(&mut self, record: RecordId, name: &str) -> Result<AttrValue> {
        let class = self.class_of(record)?;
        let attrs = self.record_attrs(record);
        if !class.has_attribute(name) {
            return Ok(AttrValue::Null);
        }
        class.read(&attrs, name)
    }

    /// Write attribute rows for a record
    pub fn write_attrs(&mut self, record: RecordId, class: &ResourceClass, attrs: &AttrMap) -> Result<()> {
        for (name, value) in attrs {
            let spec = class.attribute(name)?;
            if spec.is_reference() {
                if let AttrValue::Reference(ResourceRef::Local(h)) = value {
                    return Err(Error::Internal(format!(
                        "unresolved local reference {} in {}.{}",
                        h, class.name, name
                    )));
                }
                self.tables.set_reference(record, name, value.as_record());
            } else {
                self.tables
                    .set_serialized(record, name, value.to_json().to_string());
            }
        }
        Ok(())
    }

    /// Display label of a record, cached
    pub fn get_label(&mut self, record: RecordId) -> Result<String> {
        if let Some(label) = self.state.label_cache.get(&record) {
            return Ok(label.clone());
        }
        let class = self.class_of(record)?;
        let label = class.instance_label(&self.record_attrs(record));
        self.state.label_cache.insert(record, label.clone());
        Ok(label)
    }

    // -------------------------------------------------------------------------
    // Edges
    // -------------------------------------------------------------------------

    /// Add a parent edge in memory and in the store; cycles are refused
    pub fn add_edge(&mut self, child: RecordId, parent: RecordId) -> bool {
        if self.state.edges.has_parent(child, parent) {
            return false;
        }
        if self.state.edges.would_cycle(child, parent) {
            warn!(%child, %parent, "Refusing parent edge that would create a cycle");
            self.emit(ResourceEvent::EdgeRejected { child, parent });
            return false;
        }
        self.state.edges.add_parent(child, parent);
        if let Some(record) = self.tables.record_mut(child) {
            record.parents.insert(parent);
        }
        debug!(%child, %parent, "Added parent edge");
        true
    }

    pub fn remove_edge(&mut self, child: RecordId, parent: RecordId) {
        self.state.edges.remove_parent(child, parent);
        if let Some(record) = self.tables.record_mut(child) {
            record.parents.remove(&parent);
        }
        self.prune_propagations();
        debug!(%child, %parent, "Removed parent edge");
    }

    /// First record (self included) on a depth-first walk up parent edges
    /// whose class derives from `class_name`
    pub fn find_ancestor(&mut self, record: RecordId, class_name: &str) -> Result<Option<RecordId>> {
        let mut stack = vec![record];
        let mut seen = BTreeSet::new();
        while let Some(r) = stack.pop() {
            if !seen.insert(r) {
                continue;
            }
            if self.class_of(r)?.is_a(class_name) {
                return Ok(Some(r));
            }
            let mut parents = self.state.edges.get_parents(r);
            parents.reverse();
            stack.extend(parents);
        }
        Ok(None)
    }

    /// Every record (self included) reachable up parent edges whose class
    /// derives from `class_name`
    pub fn find_ancestors(&mut self, record: RecordId, class_name: &str) -> Result<Vec<RecordId>> {
        let mut found = Vec::new();
        let mut stack = vec![record];
        let mut seen = BTreeSet::new();
        while let Some(r) = stack.pop() {
            if !seen.insert(r) {
                continue;
            }
            if self.class_of(r)?.is_a(class_name) {
                found.push(r);
            }
            stack.extend(self.state.edges.get_parents(r));
        }
        Ok(found)
    }

    /// First record (self included) on a depth-first walk down child edges
    /// whose class derives from `class_name`. Below the starting record the
    /// walk does not descend past records of class `stop_at`.
    pub fn find_descendant(
        &mut self,
        record: RecordId,
        class_name: &str,
        stop_at: Option<&str>,
    ) -> Result<Option<RecordId>> {
        let mut stack = vec![(record, 0usize)];
        let mut seen = BTreeSet::new();
        while let Some((r, depth)) = stack.pop() {
            if !seen.insert(r) {
                continue;
            }
            let class = self.class_of(r)?;
            if class.is_a(class_name) {
                return Ok(Some(r));
            }
            if depth > 0 && stop_at.map_or(false, |s| class.is_a(s)) {
                continue;
            }
            let mut children = self.state.edges.get_children(r);
            children.reverse();
            stack.extend(children.into_iter().map(|c| (c, depth + 1)));
        }
        Ok(None)
    }
}

/// Decode the attribute rows of a record
pub(crate) fn decode_attrs(tables: &Tables, record: RecordId) -> AttrMap {
    let mut attrs = AttrMap::new();
    if let Some(rows) = tables.attr_serialized.get(&record) {
        for (name, raw) in rows {
            let value = serde_json::from_str(raw)
                .map(|v| AttrValue::from_json(&v))
                .unwrap_or_else(|_| AttrValue::String(raw.clone()));
            attrs.insert(name.clone(), value);
        }
    }
    if let Some(rows) = tables.attr_reference.get(&record) {
        for (name, target) in rows {
            attrs.insert(name.clone(), AttrValue::from(*target));
        }
    }
    attrs
}
