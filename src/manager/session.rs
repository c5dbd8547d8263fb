//! Session lifecycle and session-scoped edits

use super::events::ResourceEvent;
use super::indices::{Session, SessionKey};
use super::txn::Txn;
use crate::error::{Error, Result};
use crate::metamodel::{
    id_str, new_auto_id, AttrMap, AttrValue, LocalHandle, ResourceClass, Severity, AUTO_ID_ATTR,
};
use crate::plugin::ReportedResource;
use crate::store::RecordId;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A parent edge added or removed by a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentChange {
    pub child: LocalHandle,
    pub parent: LocalHandle,
    pub added: bool,
}

/// An alert raised or lowered on a session resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertNotice {
    pub handle: LocalHandle,
    pub active: bool,
    pub severity: Severity,
    pub alert_class: String,
    pub attribute: Option<String>,
}

/// Changes accumulated by one plugin update cycle, committed together
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub remove_local: Vec<LocalHandle>,
    pub remove_global: Vec<LocalHandle>,
    pub created: Vec<ReportedResource>,
    pub attributes: Vec<(LocalHandle, AttrMap)>,
    pub parents: Vec<ParentChange>,
    pub alerts: Vec<AlertNotice>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        !self.edits_graph() && self.alerts.is_empty()
    }

    fn edits_graph(&self) -> bool {
        !(self.remove_local.is_empty()
            && self.remove_global.is_empty()
            && self.created.is_empty()
            && self.attributes.is_empty()
            && self.parents.is_empty())
    }
}

impl Txn<'_> {
    pub fn open_session(
        &mut self,
        scannable: RecordId,
        resources: &[ReportedResource],
        update_period: Duration,
    ) -> Result<SessionKey> {
        let class = self.class_of(scannable)?;
        if !class.is_scannable() && !class.is_hostside() {
            return Err(Error::Internal(format!(
                "{} ({}) is neither scannable nor host-side",
                scannable, class.name
            )));
        }
        if self.state.sessions.remove(&scannable).is_some() {
            warn!(%scannable, "Replacing existing session");
            self.emit(ResourceEvent::SessionSuperseded {
                scannable_id: scannable,
            });
        }

        let host_id = self.read_attr(scannable, "host_id")?.as_i64();
        self.state.next_epoch += 1;
        let session = Session::new(scannable, self.state.next_epoch, update_period, host_id);
        let key = session.key();
        self.state.sessions.insert(scannable, session);

        self.persist_new_resources(&key, resources)?;
        let reported: BTreeSet<RecordId> = self
            .session(&key)?
            .local_to_global
            .values()
            .copied()
            .collect();
        self.cull(&key, &reported)?;
        self.persist_lun_updates(&key)?;
        self.persist_nid_updates(&key)?;
        self.persist_created_hosts(&key, resources)?;

        info!(%scannable, resources = resources.len(), epoch = key.epoch, "Opened session");
        self.emit(ResourceEvent::SessionOpened {
            scannable_id: scannable,
            resource_count: resources.len(),
        });
        Ok(key)
    }

    pub fn close_session(&mut self, key: &SessionKey) {
        match self.state.sessions.get(&key.scannable_id) {
            Some(session) if session.epoch == key.epoch => {
                self.state.sessions.remove(&key.scannable_id);
                info!(scannable = %key.scannable_id, "Closed session");
                self.emit(ResourceEvent::SessionClosed {
                    scannable_id: key.scannable_id,
                });
            }
            _ => warn!(scannable = %key.scannable_id, "Close for a session that is not open"),
        }
    }

    /// Drop whatever session is open for a scannable
    pub fn drop_session_of(&mut self, scannable: RecordId) {
        if self.state.sessions.remove(&scannable).is_some() {
            info!(%scannable, "Dropped session");
            self.emit(ResourceEvent::SessionClosed {
                scannable_id: scannable,
            });
        }
    }

    pub fn add_resources(&mut self, key: &SessionKey, resources: &[ReportedResource]) -> Result<()> {
        self.persist_new_resources(key, resources)?;
        self.persist_projections(key)?;
        self.persist_created_hosts(key, resources)
    }

    pub fn remove_local_resources(&mut self, key: &SessionKey, handles: &[LocalHandle]) -> Result<()> {
        self.delete_local(key, handles)?;
        self.persist_projections(key)
    }

    /// Drop the scannable's reported-by link; records left without
    /// reporters are deleted
    pub fn remove_global_resources(&mut self, key: &SessionKey, handles: &[LocalHandle]) -> Result<()> {
        self.release_global(key, handles)?;
        self.persist_projections(key)
    }

    pub fn add_parent(&mut self, key: &SessionKey, child: LocalHandle, parent: LocalHandle) -> Result<()> {
        self.edit_parent(key, child, parent, true)?;
        self.persist_lun_updates(key)
    }

    pub fn remove_parent(&mut self, key: &SessionKey, child: LocalHandle, parent: LocalHandle) -> Result<()> {
        self.edit_parent(key, child, parent, false)?;
        self.persist_lun_updates(key)
    }

    pub fn update_resource(&mut self, key: &SessionKey, handle: LocalHandle, attrs: &AttrMap) -> Result<()> {
        self.write_resource(key, handle, attrs)?;
        self.persist_projections(key)
    }

    /// Apply every change of one plugin update cycle. The host-side
    /// projections are rebuilt once, after all graph edits.
    pub fn apply_update(&mut self, key: &SessionKey, update: &SessionUpdate) -> Result<()> {
        self.session(key)?;
        self.delete_local(key, &update.remove_local)?;
        self.release_global(key, &update.remove_global)?;
        if !update.created.is_empty() {
            self.persist_new_resources(key, &update.created)?;
        }
        for (handle, attrs) in &update.attributes {
            self.write_resource(key, *handle, attrs)?;
        }
        for change in &update.parents {
            self.edit_parent(key, change.child, change.parent, change.added)?;
        }
        if update.edits_graph() {
            self.persist_projections(key)?;
            self.persist_created_hosts(key, &update.created)?;
        }
        for alert in &update.alerts {
            self.notify_alert(
                key,
                alert.handle,
                alert.active,
                alert.severity,
                &alert.alert_class,
                alert.attribute.as_deref(),
            )?;
        }
        Ok(())
    }

    fn persist_projections(&mut self, key: &SessionKey) -> Result<()> {
        self.persist_lun_updates(key)?;
        self.persist_nid_updates(key)
    }

    fn delete_local(&mut self, key: &SessionKey, handles: &[LocalHandle]) -> Result<()> {
        for handle in handles {
            match self.global_id(key, *handle)? {
                Some(record) => self.delete_resource(record)?,
                None => debug!(%handle, "Removal of resource never persisted"),
            }
        }
        Ok(())
    }

    fn release_global(&mut self, key: &SessionKey, handles: &[LocalHandle]) -> Result<()> {
        let scannable = key.scannable_id;
        for handle in handles {
            let Some(record) = self.global_id(key, *handle)? else {
                continue;
            };
            self.session_mut(key)?.forget_local(*handle);
            let orphaned = match self.tables.record_mut(record) {
                Some(row) if row.storage_id_scope.is_none() => {
                    row.reported_by.remove(&scannable);
                    row.reported_by.is_empty()
                }
                Some(_) => true,
                None => false,
            };
            if orphaned {
                self.delete_resource(record)?;
            }
        }
        Ok(())
    }

    fn edit_parent(&mut self, key: &SessionKey, child: LocalHandle, parent: LocalHandle, add: bool) -> Result<()> {
        let Some((child, parent)) = self.resolve_edge(key, child, parent)? else {
            return Ok(());
        };
        if add {
            self.add_edge(child, parent);
        } else {
            self.remove_edge(child, parent);
        }
        Ok(())
    }

    fn resolve_edge(
        &self,
        key: &SessionKey,
        child: LocalHandle,
        parent: LocalHandle,
    ) -> Result<Option<(RecordId, RecordId)>> {
        let (Some(c), Some(p)) = (self.global_id(key, child)?, self.global_id(key, parent)?) else {
            let race = Error::DependencyRace {
                scannable_id: key.scannable_id,
                child: child.0,
                parent: parent.0,
            };
            warn!(error = %race, "Ignoring edge edit");
            return Ok(None);
        };
        Ok(Some((c, p)))
    }

    fn write_resource(&mut self, key: &SessionKey, handle: LocalHandle, attrs: &AttrMap) -> Result<()> {
        let Some(record) = self.global_id(key, handle)? else {
            warn!(%handle, "Update for resource never persisted");
            return Ok(());
        };
        let class = self.class_of(record)?;
        let attrs = self.globalize(key, attrs)?;
        self.write_attrs(record, &class, &attrs)?;
        self.state.label_cache.remove(&record);
        self.reindex(record, &class);
        Ok(())
    }

    /// Re-evaluate subscriptions of a record after its attributes changed.
    /// Newly matching partners gain an edge; existing edges are kept.
    pub fn reindex(&mut self, record: RecordId, class: &ResourceClass) {
        let attrs = self.record_attrs(record);
        self.state.subscribers.remove_resource(record);
        self.state
            .subscribers
            .add_resource(self.registry, record, class, &attrs);
        let subscribers = self
            .state
            .subscribers
            .what_subscribes(self.registry, class, &attrs);
        for subscriber in subscribers {
            if subscriber != record {
                self.add_edge(subscriber, record);
            }
        }
        let providers = self
            .state
            .subscribers
            .what_provides(self.registry, class, &attrs);
        for provider in providers {
            if provider != record {
                self.add_edge(record, provider);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Administrative
    // -------------------------------------------------------------------------

    /// Change attributes of a record outside any session
    pub fn modify_resource(&mut self, record: RecordId, attrs: &AttrMap) -> Result<()> {
        let class = self.class_of(record)?;
        self.drop_session_of(record);
        let mut prepared = AttrMap::new();
        for (name, value) in attrs {
            prepared.insert(name.clone(), class.prepare(name, value.clone())?);
        }
        self.write_attrs(record, &class, &prepared)?;
        self.state.label_cache.clear();
        self.reindex(record, &class);
        info!(%record, attributes = prepared.len(), "Modified storage resource");
        Ok(())
    }

    /// Get or create a root record, typically a scannable
    pub fn create_root_resource(&mut self, class: &ResourceClass, attrs: AttrMap) -> Result<RecordId> {
        let mut prepared = AttrMap::new();
        for (name, value) in attrs {
            let value = class.prepare(&name, value)?;
            prepared.insert(name, value);
        }
        let auto = class.identifier.as_ref().map_or(false, |i| i.is_auto());
        if auto && !prepared.contains_key(AUTO_ID_ATTR) {
            prepared.insert(AUTO_ID_ATTR.to_string(), AttrValue::String(new_auto_id()));
        }
        class.validate(&prepared)?;

        let id_string = id_str(&class.id_tuple(&prepared)?)?;
        let (record, created) = self.tables.get_or_create_record(class.id, &id_string, None);
        self.state.class_index.insert(record, class.id);
        if created {
            self.write_attrs(record, class, &prepared)?;
            self.state
                .subscribers
                .add_resource(self.registry, record, class, &prepared);
            info!(%record, class = %class.name, "Created root resource");
            self.emit(ResourceEvent::RecordCreated {
                record_id: record,
                class_name: class.name.clone(),
            });
        }
        Ok(record)
    }
}
