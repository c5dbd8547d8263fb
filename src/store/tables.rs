//! Persisted tables

use super::{AlertId, ClassId, RecordId, VolumeId, VolumeNodeId};
use crate::metamodel::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

// =============================================================================
// Rows
// =============================================================================

/// A loaded plugin module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRow {
    pub name: String,
    pub internal: bool,
}

/// A registered resource class, unique by (module, class)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceClassRow {
    pub id: ClassId,
    pub module: String,
    pub class_name: String,
}

/// A persisted storage resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: RecordId,
    pub class_id: ClassId,
    /// Identifier tuple serialized as a JSON array
    pub storage_id_str: String,
    /// Scannable the identifier is scoped to (scoped ids only)
    pub storage_id_scope: Option<RecordId>,
    pub alias: Option<String>,
    pub parents: BTreeSet<RecordId>,
    pub reported_by: BTreeSet<RecordId>,
    pub created_at: DateTime<Utc>,
}

/// A derived Volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRow {
    pub id: VolumeId,
    pub storage_resource: Option<RecordId>,
    pub size: Option<i64>,
    pub label: String,
    pub filesystem_type: Option<String>,
    pub usable_for_lustre: bool,
    /// Set by higher layers when a target is built on this volume
    pub claimed: bool,
}

/// A derived per-host access path to a Volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeNodeRow {
    pub id: VolumeNodeId,
    pub volume_id: VolumeId,
    pub host_id: i64,
    pub path: String,
    pub storage_resource: Option<RecordId>,
    pub primary: bool,
    pub used: bool,
}

/// What an alert is raised against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum AlertSubject {
    Record(RecordId),
    Host(i64),
}

/// Family of an alert state row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Raised by a resource alert condition
    Condition,
    /// Raised when a scannable's scan loop stops
    Offline,
    /// Raised when a host's NID set changes
    LnetNidsChanged,
}

/// An alert active window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertStateRow {
    pub id: AlertId,
    pub subject: AlertSubject,
    pub kind: AlertKind,
    pub alert_class: String,
    pub attribute: Option<String>,
    pub severity: Severity,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub active: bool,
}

/// First sighting of a record within a host session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnEventRow {
    pub record_id: RecordId,
    pub host_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Host network interface projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterfaceRow {
    pub id: u64,
    pub host_id: i64,
    pub name: String,
    pub inet4_address: Option<String>,
    pub inet4_prefix: Option<i64>,
    pub type_name: Option<String>,
    pub state_up: bool,
}

/// LNet NID bound to a network interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NidRow {
    pub id: u64,
    pub host_id: i64,
    pub network_interface: u64,
    pub lnd_network: Option<i64>,
    pub lnd_type: Option<String>,
}

/// Per-host LNet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnetConfigurationRow {
    pub host_id: i64,
    pub state: String,
}

// =============================================================================
// Tables
// =============================================================================

type RecordKey = (ClassId, String, Option<RecordId>);

/// All persisted state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    next_id: u64,
    pub plugins: BTreeMap<String, PluginRow>,
    pub resource_classes: BTreeMap<ClassId, ResourceClassRow>,
    pub records: BTreeMap<RecordId, ResourceRecord>,
    pub attr_serialized: BTreeMap<RecordId, BTreeMap<String, String>>,
    pub attr_reference: BTreeMap<RecordId, BTreeMap<String, Option<RecordId>>>,
    pub volumes: BTreeMap<VolumeId, VolumeRow>,
    pub volume_nodes: BTreeMap<VolumeNodeId, VolumeNodeRow>,
    pub alert_states: BTreeMap<AlertId, AlertStateRow>,
    pub alert_propagated: BTreeMap<AlertId, BTreeSet<RecordId>>,
    pub learn_events: Vec<LearnEventRow>,
    pub network_interfaces: BTreeMap<u64, NetworkInterfaceRow>,
    pub nids: BTreeMap<u64, NidRow>,
    pub lnet_configurations: BTreeMap<i64, LnetConfigurationRow>,
    #[serde(skip)]
    identity: HashMap<RecordKey, RecordId>,
    /// Scope record to the records scoped to it
    #[serde(skip)]
    scoped: HashMap<RecordId, BTreeSet<RecordId>>,
    /// Reference target to the records pointing at it
    #[serde(skip)]
    referrers: HashMap<RecordId, BTreeSet<RecordId>>,
    #[serde(skip)]
    volume_by_resource: HashMap<RecordId, VolumeId>,
    #[serde(skip)]
    node_by_resource: HashMap<RecordId, VolumeNodeId>,
    #[serde(skip)]
    nodes_by_volume: HashMap<VolumeId, BTreeSet<VolumeNodeId>>,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Rebuild in-memory lookup indexes after deserialization
    pub fn rebuild_indexes(&mut self) {
        self.identity = self
            .records
            .values()
            .map(|r| {
                (
                    (r.class_id, r.storage_id_str.clone(), r.storage_id_scope),
                    r.id,
                )
            })
            .collect();

        self.scoped.clear();
        for record in self.records.values() {
            if let Some(scope) = record.storage_id_scope {
                self.scoped.entry(scope).or_default().insert(record.id);
            }
        }

        self.referrers.clear();
        for (record, attrs) in &self.attr_reference {
            for target in attrs.values().flatten() {
                self.referrers.entry(*target).or_default().insert(*record);
            }
        }

        self.volume_by_resource = self
            .volumes
            .values()
            .filter_map(|v| v.storage_resource.map(|s| (s, v.id)))
            .collect();

        self.node_by_resource.clear();
        self.nodes_by_volume.clear();
        for node in self.volume_nodes.values() {
            if let Some(resource) = node.storage_resource {
                self.node_by_resource.insert(resource, node.id);
            }
            self.nodes_by_volume
                .entry(node.volume_id)
                .or_default()
                .insert(node.id);
        }
    }

    // -------------------------------------------------------------------------
    // Plugins and classes
    // -------------------------------------------------------------------------

    pub fn upsert_plugin(&mut self, name: &str, internal: bool) {
        self.plugins
            .entry(name.to_string())
            .and_modify(|p| p.internal = internal)
            .or_insert_with(|| PluginRow {
                name: name.to_string(),
                internal,
            });
    }

    /// Get or create the class row for (module, class)
    pub fn upsert_resource_class(&mut self, module: &str, class_name: &str) -> ClassId {
        if let Some(row) = self
            .resource_classes
            .values()
            .find(|c| c.module == module && c.class_name == class_name)
        {
            return row.id;
        }
        let id = ClassId(self.allocate_id());
        self.resource_classes.insert(
            id,
            ResourceClassRow {
                id,
                module: module.to_string(),
                class_name: class_name.to_string(),
            },
        );
        id
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    pub fn find_record(
        &self,
        class_id: ClassId,
        id_str: &str,
        scope: Option<RecordId>,
    ) -> Option<RecordId> {
        self.identity
            .get(&(class_id, id_str.to_string(), scope))
            .copied()
    }

    /// Upsert by (class, identifier, scope); returns the id and whether it was created
    pub fn get_or_create_record(
        &mut self,
        class_id: ClassId,
        id_str: &str,
        scope: Option<RecordId>,
    ) -> (RecordId, bool) {
        if let Some(id) = self.find_record(class_id, id_str, scope) {
            return (id, false);
        }
        let id = RecordId(self.allocate_id());
        self.records.insert(
            id,
            ResourceRecord {
                id,
                class_id,
                storage_id_str: id_str.to_string(),
                storage_id_scope: scope,
                alias: None,
                parents: BTreeSet::new(),
                reported_by: BTreeSet::new(),
                created_at: Utc::now(),
            },
        );
        self.identity
            .insert((class_id, id_str.to_string(), scope), id);
        if let Some(scope) = scope {
            self.scoped.entry(scope).or_default().insert(id);
        }
        (id, true)
    }

    pub fn record(&self, id: RecordId) -> Option<&ResourceRecord> {
        self.records.get(&id)
    }

    pub fn record_mut(&mut self, id: RecordId) -> Option<&mut ResourceRecord> {
        self.records.get_mut(&id)
    }

    /// Remove a record and its attribute rows
    pub fn delete_record(&mut self, id: RecordId) -> Option<ResourceRecord> {
        let record = self.records.remove(&id)?;
        self.identity.remove(&(
            record.class_id,
            record.storage_id_str.clone(),
            record.storage_id_scope,
        ));
        if let Some(scope) = record.storage_id_scope {
            remove_from(&mut self.scoped, scope, &id);
        }
        self.attr_serialized.remove(&id);
        if let Some(refs) = self.attr_reference.remove(&id) {
            for target in refs.values().flatten() {
                remove_from(&mut self.referrers, *target, &id);
            }
        }
        Some(record)
    }

    pub fn records_scoped_to(&self, scope: RecordId) -> Vec<RecordId> {
        self.scoped
            .get(&scope)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn records_reported_by(&self, scannable: RecordId) -> Vec<RecordId> {
        self.records
            .values()
            .filter(|r| r.reported_by.contains(&scannable))
            .map(|r| r.id)
            .collect()
    }

    /// Records holding a reference attribute that points at `target`
    pub fn referrers_of(&self, target: RecordId) -> Vec<RecordId> {
        self.referrers
            .get(&target)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Attributes
    // -------------------------------------------------------------------------

    pub fn set_serialized(&mut self, record: RecordId, key: &str, value: String) {
        let previous = self
            .attr_reference
            .get_mut(&record)
            .and_then(|refs| refs.remove(key))
            .flatten();
        if let Some(previous) = previous {
            self.unlink_reference(record, previous);
        }
        self.attr_serialized
            .entry(record)
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn set_reference(&mut self, record: RecordId, key: &str, value: Option<RecordId>) {
        if let Some(ser) = self.attr_serialized.get_mut(&record) {
            ser.remove(key);
        }
        let previous = self
            .attr_reference
            .entry(record)
            .or_default()
            .insert(key.to_string(), value)
            .flatten();
        if let Some(previous) = previous {
            self.unlink_reference(record, previous);
        }
        if let Some(target) = value {
            self.referrers.entry(target).or_default().insert(record);
        }
    }

    /// Drop `record` from the referrers of `target` unless another of its
    /// attributes still points there
    fn unlink_reference(&mut self, record: RecordId, target: RecordId) {
        let still_referenced = self
            .attr_reference
            .get(&record)
            .map_or(false, |attrs| attrs.values().any(|v| *v == Some(target)));
        if !still_referenced {
            remove_from(&mut self.referrers, target, &record);
        }
    }

    /// Null every reference attribute pointing at `target`
    pub fn clear_references_to(&mut self, target: RecordId) {
        let Some(referrers) = self.referrers.remove(&target) else {
            return;
        };
        for referrer in referrers {
            if let Some(attrs) = self.attr_reference.get_mut(&referrer) {
                for value in attrs.values_mut() {
                    if *value == Some(target) {
                        *value = None;
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Volumes
    // -------------------------------------------------------------------------

    pub fn volume_for_resource(&self, record: RecordId) -> Option<VolumeId> {
        self.volume_by_resource.get(&record).copied()
    }

    pub fn create_volume(
        &mut self,
        storage_resource: RecordId,
        size: Option<i64>,
        label: String,
        filesystem_type: Option<String>,
        usable_for_lustre: bool,
    ) -> VolumeId {
        let id = VolumeId(self.allocate_id());
        self.volumes.insert(
            id,
            VolumeRow {
                id,
                storage_resource: Some(storage_resource),
                size,
                label,
                filesystem_type,
                usable_for_lustre,
                claimed: false,
            },
        );
        self.volume_by_resource.insert(storage_resource, id);
        id
    }

    pub fn remove_volume(&mut self, id: VolumeId) -> Option<VolumeRow> {
        let row = self.volumes.remove(&id)?;
        self.forget_volume_resource(&row);
        Some(row)
    }

    /// Unlink a Volume from its storage resource, keeping the row
    pub fn detach_volume(&mut self, id: VolumeId) {
        if let Some(row) = self.volumes.get(&id).cloned() {
            self.forget_volume_resource(&row);
        }
        if let Some(row) = self.volumes.get_mut(&id) {
            row.storage_resource = None;
        }
    }

    fn forget_volume_resource(&mut self, row: &VolumeRow) {
        if let Some(resource) = row.storage_resource {
            if self.volume_by_resource.get(&resource) == Some(&row.id) {
                self.volume_by_resource.remove(&resource);
            }
        }
    }

    pub fn nodes_of_volume(&self, volume: VolumeId) -> Vec<VolumeNodeId> {
        self.nodes_by_volume
            .get(&volume)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn volume_node_at(&self, host_id: i64, path: &str) -> Option<VolumeNodeId> {
        self.volume_nodes
            .values()
            .find(|n| n.host_id == host_id && n.path == path)
            .map(|n| n.id)
    }

    pub fn volume_node_for_resource(&self, record: RecordId) -> Option<VolumeNodeId> {
        self.node_by_resource.get(&record).copied()
    }

    pub fn create_volume_node(
        &mut self,
        volume_id: VolumeId,
        host_id: i64,
        path: &str,
        storage_resource: RecordId,
    ) -> VolumeNodeId {
        let id = VolumeNodeId(self.allocate_id());
        self.volume_nodes.insert(
            id,
            VolumeNodeRow {
                id,
                volume_id,
                host_id,
                path: path.to_string(),
                storage_resource: Some(storage_resource),
                primary: false,
                used: false,
            },
        );
        self.node_by_resource.insert(storage_resource, id);
        self.nodes_by_volume.entry(volume_id).or_default().insert(id);
        id
    }

    pub fn remove_volume_node(&mut self, id: VolumeNodeId) -> Option<VolumeNodeRow> {
        let row = self.volume_nodes.remove(&id)?;
        if let Some(resource) = row.storage_resource {
            if self.node_by_resource.get(&resource) == Some(&id) {
                self.node_by_resource.remove(&resource);
            }
        }
        remove_from(&mut self.nodes_by_volume, row.volume_id, &id);
        Some(row)
    }

    // -------------------------------------------------------------------------
    // Alerts
    // -------------------------------------------------------------------------

    pub fn create_alert(
        &mut self,
        subject: AlertSubject,
        kind: AlertKind,
        alert_class: &str,
        attribute: Option<&str>,
        severity: Severity,
    ) -> AlertId {
        let id = AlertId(self.allocate_id());
        let now = Utc::now();
        self.alert_states.insert(
            id,
            AlertStateRow {
                id,
                subject,
                kind,
                alert_class: alert_class.to_string(),
                attribute: attribute.map(str::to_string),
                severity,
                begin: now,
                end: now,
                active: true,
            },
        );
        id
    }

    /// Mark an alert inactive and drop its propagations
    pub fn end_alert(&mut self, id: AlertId) {
        if let Some(alert) = self.alert_states.get_mut(&id) {
            alert.active = false;
            alert.end = Utc::now();
        }
        self.alert_propagated.remove(&id);
    }

    pub fn active_alert(&self, subject: AlertSubject, kind: AlertKind) -> Option<AlertId> {
        self.alert_states
            .values()
            .find(|a| a.active && a.subject == subject && a.kind == kind)
            .map(|a| a.id)
    }

    // -------------------------------------------------------------------------
    // Network projection
    // -------------------------------------------------------------------------

    pub fn network_interface(&self, host_id: i64, name: &str) -> Option<u64> {
        self.network_interfaces
            .values()
            .find(|i| i.host_id == host_id && i.name == name)
            .map(|i| i.id)
    }

    pub fn get_or_create_network_interface(&mut self, host_id: i64, name: &str) -> u64 {
        if let Some(id) = self.network_interface(host_id, name) {
            return id;
        }
        let id = self.allocate_id();
        self.network_interfaces.insert(
            id,
            NetworkInterfaceRow {
                id,
                host_id,
                name: name.to_string(),
                inet4_address: None,
                inet4_prefix: None,
                type_name: None,
                state_up: false,
            },
        );
        id
    }

    pub fn get_or_create_nid(&mut self, host_id: i64, network_interface: u64) -> u64 {
        if let Some(nid) = self
            .nids
            .values()
            .find(|n| n.network_interface == network_interface)
        {
            return nid.id;
        }
        let id = self.allocate_id();
        self.nids.insert(
            id,
            NidRow {
                id,
                host_id,
                network_interface,
                lnd_network: None,
                lnd_type: None,
            },
        );
        id
    }

    pub fn nids_of_host(&self, host_id: i64) -> Vec<NidRow> {
        self.nids
            .values()
            .filter(|n| n.host_id == host_id)
            .cloned()
            .collect()
    }
}

/// Remove `value` from the set under `key`, dropping the set once empty
fn remove_from<K, V>(index: &mut HashMap<K, BTreeSet<V>>, key: K, value: &V)
where
    K: std::hash::Hash + Eq,
    V: Ord,
{
    if let Some(set) = index.get_mut(&key) {
        set.remove(value);
        if set.is_empty() {
            index.remove(&key);
        }
    }
}
