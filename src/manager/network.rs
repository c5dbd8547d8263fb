//! Host network interface and LNet NID projection

use super::events::ResourceEvent;
use super::indices::SessionKey;
use super::txn::Txn;
use crate::error::Result;
use crate::metamodel::{builtin, Severity};
use crate::store::{AlertKind, AlertSubject, LnetConfigurationRow, RecordId};
use tracing::{debug, info, warn};

pub const LNET_NIDS_CHANGED_ALERT: &str = "LNetNidsChangedAlert";

impl Txn<'_> {
    /// Project NetworkInterface, LnetInterface and LnetModules resources
    /// of a host-side scannable onto the per-host network tables
    pub fn persist_nid_updates(&mut self, key: &SessionKey) -> Result<()> {
        let scannable = key.scannable_id;
        let Some(host_id) = self.session(key)?.host_id else {
            return Ok(());
        };
        let previous = self.tables.nids_of_host(host_id);

        let mut interfaces = Vec::new();
        let mut lnet_interfaces = Vec::new();
        let mut lnet_modules = Vec::new();
        for record in self.tables.records_scoped_to(scannable) {
            let class = self.class_of(record)?;
            if class.is_a(builtin::NETWORK_INTERFACE) {
                interfaces.push(record);
            } else if class.is_a(builtin::LNET_INTERFACE) {
                lnet_interfaces.push(record);
            } else if class.is_a(builtin::LNET_MODULES) {
                lnet_modules.push(record);
            }
        }
        if interfaces.is_empty() && lnet_interfaces.is_empty() && lnet_modules.is_empty() {
            return Ok(());
        }

        for record in interfaces {
            if self.read_attr(record, "host_id")?.as_i64() != Some(host_id) {
                continue;
            }
            let name = self.read_attr(record, "name")?;
            let Some(name) = name.as_str() else { continue };
            let inet4_address = self.read_attr(record, "inet4_address")?.as_str().map(str::to_string);
            let inet4_prefix = self.read_attr(record, "inet4_prefix")?.as_i64();
            let type_name = self.read_attr(record, "type")?.as_str().map(str::to_string);
            let state_up = self.read_attr(record, "up")?.as_bool().unwrap_or(false);

            let id = self.tables.get_or_create_network_interface(host_id, name);
            if let Some(row) = self.tables.network_interfaces.get_mut(&id) {
                row.inet4_address = inet4_address;
                row.inet4_prefix = inet4_prefix;
                row.type_name = type_name;
                row.state_up = state_up;
            }
        }

        for record in lnet_modules {
            let state = self.read_attr(record, "state")?;
            let state = state.as_str().unwrap_or_default().to_string();
            debug!(host_id, %state, "LNet configuration");
            self.tables
                .lnet_configurations
                .insert(host_id, LnetConfigurationRow { host_id, state });
        }

        for record in lnet_interfaces {
            let Some(interface) = self.interface_row_of(record, host_id)? else {
                warn!(lnet_interface = %record, "LNet interface without a known network interface");
                continue;
            };
            let lnd_network = self.read_attr(record, "lnd_network")?.as_i64();
            let lnd_type = self.read_attr(record, "lnd_type")?.as_str().map(str::to_string);
            let nid = self.tables.get_or_create_nid(host_id, interface);
            if let Some(row) = self.tables.nids.get_mut(&nid) {
                row.lnd_network = lnd_network;
                row.lnd_type = lnd_type;
            }
        }

        if previous.is_empty() {
            return Ok(());
        }
        let current = self.tables.nids_of_host(host_id);
        let subject = AlertSubject::Host(host_id);
        let active = self.tables.active_alert(subject, AlertKind::LnetNidsChanged);
        match (current != previous, active) {
            (true, None) => {
                info!(host_id, "LNet NIDs changed");
                let alert_id = self.tables.create_alert(
                    subject,
                    AlertKind::LnetNidsChanged,
                    LNET_NIDS_CHANGED_ALERT,
                    None,
                    Severity::Warning,
                );
                self.emit(ResourceEvent::AlertRaised {
                    alert_id,
                    record_id: None,
                    alert_class: LNET_NIDS_CHANGED_ALERT.to_string(),
                });
            }
            (false, Some(alert_id)) => {
                self.tables.end_alert(alert_id);
                self.emit(ResourceEvent::AlertLowered {
                    alert_id,
                    alert_class: LNET_NIDS_CHANGED_ALERT.to_string(),
                });
            }
            _ => {}
        }
        Ok(())
    }

    /// Network interface row backing an LnetInterface record, found
    /// through its NetworkInterface ancestor
    pub fn interface_row_of(&mut self, lnet_interface: RecordId, host_id: i64) -> Result<Option<u64>> {
        let Some(parent) = self.find_ancestor(lnet_interface, builtin::NETWORK_INTERFACE)? else {
            return Ok(None);
        };
        let name = self.read_attr(parent, "name")?;
        Ok(name
            .as_str()
            .and_then(|n| self.tables.network_interface(host_id, n)))
    }

    /// Drop projection rows for a NetworkInterface, LnetInterface or
    /// LnetModules record about to be deleted
    pub fn remove_network_projection(&mut self, record: RecordId) -> Result<()> {
        let class = self.class_of(record)?;
        if class.is_a(builtin::NETWORK_INTERFACE) {
            let host_id = self.read_attr(record, "host_id")?.as_i64();
            let name = self.read_attr(record, "name")?;
            if let (Some(host_id), Some(name)) = (host_id, name.as_str()) {
                if let Some(id) = self.tables.network_interface(host_id, name) {
                    self.tables.network_interfaces.remove(&id);
                    self.tables.nids.retain(|_, n| n.network_interface != id);
                }
            }
        } else if class.is_a(builtin::LNET_INTERFACE) {
            let Some(host_id) = self.scope_host_id(record)? else {
                return Ok(());
            };
            if let Some(interface) = self.interface_row_of(record, host_id)? {
                self.tables.nids.retain(|_, n| n.network_interface != interface);
            }
        } else if class.is_a(builtin::LNET_MODULES) {
            if let Some(host_id) = self.read_attr(record, "host_id")?.as_i64() {
                self.tables.lnet_configurations.remove(&host_id);
            }
        }
        Ok(())
    }

    /// `host_id` of the scannable a scoped record belongs to
    fn scope_host_id(&mut self, record: RecordId) -> Result<Option<i64>> {
        let Some(scope) = self.tables.record(record).and_then(|r| r.storage_id_scope) else {
            return Ok(None);
        };
        if !self.class_of(scope)?.has_attribute("host_id") {
            return Ok(None);
        }
        Ok(self.read_attr(scope, "host_id")?.as_i64())
    }
}
