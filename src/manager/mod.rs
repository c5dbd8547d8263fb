//! Resource Manager
//!
//! Owns the persistent storage resource graph. Plugin sessions report
//! resources through the entry points below; every entry point runs as one
//! transaction against working copies of the in-memory indices and the
//! store tables, and publishes its events only once committed.

mod alerts;
mod events;
mod indices;
mod metrics;
mod network;
mod persist;
mod removal;
mod session;
mod txn;
mod volumes;

pub use alerts::OFFLINE_ALERT;
pub use events::ResourceEvent;
pub use indices::{EdgeIndex, SessionKey};
pub use metrics::{ManagerMetrics, ManagerMetricsSnapshot};
pub use network::LNET_NIDS_CHANGED_ALERT;
pub use session::{AlertNotice, ParentChange, SessionUpdate};

use crate::error::{Error, Result};
use crate::jobs::JobScheduler;
use crate::metamodel::{AttrMap, AttrValue, LocalHandle, ResourceClass, Severity};
use crate::plugin::{ClassRegistry, ReportedResource};
use crate::store::{AlertKind, AlertSubject, RecordId, Store, VolumeId};
use indices::ManagerState;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use txn::{decode_attrs, Txn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A stored record with decoded attributes
#[derive(Debug, Clone)]
pub struct StoredResource {
    pub id: RecordId,
    pub class: Arc<ResourceClass>,
    pub attributes: AttrMap,
    pub alias: Option<String>,
}

/// Process-wide resource manager
pub struct ResourceManager {
    registry: Arc<ClassRegistry>,
    store: Arc<Store>,
    jobs: Arc<dyn JobScheduler>,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<ResourceEvent>,
    metrics: ManagerMetrics,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("sessions", &self.state.lock().sessions.len())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

impl ResourceManager {
    /// Build the manager, loading edges, subscriptions and active alerts
    /// from the store
    pub fn new(registry: Arc<ClassRegistry>, store: Arc<Store>, jobs: Arc<dyn JobScheduler>) -> Self {
        let state = store.read(|tables| {
            let mut state = ManagerState::default();
            for record in tables.records.values() {
                state.class_index.insert(record.id, record.class_id);
                for parent in &record.parents {
                    state.edges.add_parent(record.id, *parent);
                }
                match registry.get(record.class_id) {
                    Some(class) => {
                        let attrs = decode_attrs(tables, record.id);
                        state
                            .subscribers
                            .add_resource(&registry, record.id, class, &attrs);
                    }
                    None => warn!(
                        record = %record.id,
                        class_id = %record.class_id,
                        "Record of a class that is not loaded"
                    ),
                }
            }
            for alert in tables.alert_states.values() {
                if let (true, AlertKind::Condition, AlertSubject::Record(record)) =
                    (alert.active, alert.kind, alert.subject)
                {
                    state
                        .active_alerts
                        .insert((record, alert.alert_class.clone()), alert.id);
                }
            }
            state
        });
        info!(
            records = state.class_index.len(),
            active_alerts = state.active_alerts.len(),
            "Resource manager loaded"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            store,
            jobs,
            state: Mutex::new(state),
            events,
            metrics: ManagerMetrics::new(),
        }
    }

    /// Run `f` atomically over the indices and the store
    fn with_txn<R>(&self, f: impl FnOnce(&mut Txn<'_>) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock();
        let mut working = state.clone();
        let outcome = self.store.transaction(|tables| {
            let mut txn = Txn::new(&self.registry, self.jobs.as_ref(), &mut working, tables);
            let result = f(&mut txn)?;
            Ok((result, txn.events))
        });
        match outcome {
            Ok((result, events)) => {
                *state = working;
                drop(state);
                for event in events {
                    self.metrics.observe(&event);
                    // No receivers is fine
                    let _ = self.events.send(event);
                }
                Ok(result)
            }
            Err(e) => {
                if matches!(e, Error::SessionStale { .. }) {
                    self.metrics.record_stale_rejection();
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Session entry points
    // =========================================================================

    pub fn session_open(
        &self,
        scannable_id: RecordId,
        resources: &[ReportedResource],
        update_period: Duration,
    ) -> Result<SessionKey> {
        self.with_txn(|txn| txn.open_session(scannable_id, resources, update_period))
    }

    pub fn session_close(&self, key: &SessionKey) {
        if let Err(e) = self.with_txn(|txn| {
            txn.close_session(key);
            Ok(())
        }) {
            warn!(scannable = %key.scannable_id, error = %e, "Failed to close session");
        }
    }

    pub fn session_add_resources(&self, key: &SessionKey, resources: &[ReportedResource]) -> Result<()> {
        self.with_txn(|txn| txn.add_resources(key, resources))
    }

    pub fn session_remove_local_resources(&self, key: &SessionKey, handles: &[LocalHandle]) -> Result<()> {
        self.with_txn(|txn| txn.remove_local_resources(key, handles))
    }

    pub fn session_remove_global_resources(&self, key: &SessionKey, handles: &[LocalHandle]) -> Result<()> {
        self.with_txn(|txn| txn.remove_global_resources(key, handles))
    }

    pub fn session_resource_add_parent(
        &self,
        key: &SessionKey,
        child: LocalHandle,
        parent: LocalHandle,
    ) -> Result<()> {
        self.with_txn(|txn| txn.add_parent(key, child, parent))
    }

    pub fn session_resource_remove_parent(
        &self,
        key: &SessionKey,
        child: LocalHandle,
        parent: LocalHandle,
    ) -> Result<()> {
        self.with_txn(|txn| txn.remove_parent(key, child, parent))
    }

    pub fn session_update_resource(&self, key: &SessionKey, handle: LocalHandle, attrs: &AttrMap) -> Result<()> {
        self.with_txn(|txn| txn.update_resource(key, handle, attrs))
    }

    /// Commit one plugin update cycle in a single transaction
    pub fn session_apply_update(&self, key: &SessionKey, update: &SessionUpdate) -> Result<()> {
        self.with_txn(|txn| txn.apply_update(key, update))
    }

    pub fn session_notify_alert(
        &self,
        key: &SessionKey,
        handle: LocalHandle,
        active: bool,
        severity: Severity,
        alert_class: &str,
        attribute: Option<&str>,
    ) -> Result<()> {
        self.with_txn(|txn| txn.notify_alert(key, handle, active, severity, alert_class, attribute))
    }

    // =========================================================================
    // Administrative entry points
    // =========================================================================

    /// Delete a record and everything depending on it
    pub fn global_remove_resource(&self, record: RecordId) -> Result<()> {
        if self.store.read(|t| t.record(record).is_none()) {
            error!(%record, "Removal requested for unknown resource");
            return Ok(());
        }
        self.with_txn(|txn| {
            txn.drop_session_of(record);
            txn.delete_resource(record)
        })
    }

    pub fn modify_resource(&self, record: RecordId, attrs: &AttrMap) -> Result<()> {
        self.with_txn(|txn| txn.modify_resource(record, attrs))
    }

    pub fn create_root_resource(&self, class: &Arc<ResourceClass>, attrs: AttrMap) -> Result<RecordId> {
        self.with_txn(|txn| txn.create_root_resource(class, attrs))
    }

    pub fn notify_offline(&self, scannable: RecordId, offline: bool) -> Result<()> {
        self.with_txn(|txn| txn.notify_offline(scannable, offline))
    }

    /// Mark a Volume as used by a higher layer, keeping it alive without nodes
    pub fn set_volume_claimed(&self, volume: VolumeId, claimed: bool) -> Result<()> {
        self.with_txn(|txn| {
            let row = txn
                .tables
                .volumes
                .get_mut(&volume)
                .ok_or_else(|| Error::Internal(format!("no volume {}", volume)))?;
            row.claimed = claimed;
            if !claimed {
                txn.try_removing_volume(volume)?;
            }
            Ok(())
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_resource(&self, record: RecordId) -> Result<StoredResource> {
        self.store.read(|tables| {
            let row = tables
                .record(record)
                .ok_or(Error::RecordNotFound { record_id: record })?;
            let class = self
                .registry
                .get(row.class_id)
                .cloned()
                .ok_or_else(|| Error::PluginNotFound(format!("resource class {}", row.class_id)))?;
            Ok(StoredResource {
                id: record,
                class,
                attributes: decode_attrs(tables, record),
                alias: row.alias.clone(),
            })
        })
    }

    pub fn get_label(&self, record: RecordId) -> Result<String> {
        self.with_txn(|txn| txn.get_label(record))
    }

    /// Records of a class (or subclass) whose attribute equals `value`
    pub fn records_with_attribute(&self, class_name: &str, key: &str, value: &AttrValue) -> Vec<RecordId> {
        self.store.read(|tables| {
            tables
                .records
                .values()
                .filter(|r| {
                    self.registry
                        .get(r.class_id)
                        .map_or(false, |c| c.is_a(class_name))
                })
                .filter(|r| decode_attrs(tables, r.id).get(key) == Some(value))
                .map(|r| r.id)
                .collect()
        })
    }

    pub fn session_for(&self, scannable: RecordId) -> Option<SessionKey> {
        self.state.lock().sessions.get(&scannable).map(|s| s.key())
    }

    pub fn parents_of(&self, record: RecordId) -> Vec<RecordId> {
        self.state.lock().edges.get_parents(record)
    }

    pub fn children_of(&self, record: RecordId) -> Vec<RecordId> {
        self.state.lock().edges.get_children(record)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> ManagerMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

#[cfg(test)]
mod tests;
