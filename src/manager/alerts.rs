//! Alert engine: active alert tracking and propagation to descendants

use super::events::ResourceEvent;
use super::indices::SessionKey;
use super::txn::Txn;
use crate::error::Result;
use crate::metamodel::{LocalHandle, Severity};
use crate::store::{AlertId, AlertKind, AlertSubject, RecordId};
use chrono::Utc;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

pub const OFFLINE_ALERT: &str = "OfflineAlert";

impl Txn<'_> {
    /// Apply an alert notification for a session resource
    pub fn notify_alert(
        &mut self,
        key: &SessionKey,
        handle: LocalHandle,
        active: bool,
        severity: Severity,
        alert_class: &str,
        attribute: Option<&str>,
    ) -> Result<()> {
        let Some(record) = self.global_id(key, handle)? else {
            warn!(%handle, %alert_class, "Alert notification for unknown resource");
            return Ok(());
        };
        let slot = (record, alert_class.to_string());
        let existing = self.state.active_alerts.get(&slot).copied();

        match (active, existing) {
            (true, None) => {
                let alert_id = self.tables.create_alert(
                    AlertSubject::Record(record),
                    AlertKind::Condition,
                    alert_class,
                    attribute,
                    severity,
                );
                let descendants = self.state.edges.descendants(record);
                debug!(%record, %alert_class, propagated = descendants.len(), "Raised alert");
                if !descendants.is_empty() {
                    self.tables.alert_propagated.insert(alert_id, descendants);
                }
                self.state.active_alerts.insert(slot, alert_id);
                info!(%record, %alert_class, %severity, "Alert raised");
                self.emit(ResourceEvent::AlertRaised {
                    alert_id,
                    record_id: Some(record),
                    alert_class: alert_class.to_string(),
                });
            }
            (true, Some(alert_id)) => {
                if let Some(row) = self.tables.alert_states.get_mut(&alert_id) {
                    row.end = Utc::now();
                }
            }
            (false, Some(alert_id)) => {
                self.state.active_alerts.remove(&slot);
                self.lower_alert(alert_id);
            }
            (false, None) => {}
        }
        Ok(())
    }

    /// Raise or lower the offline alert of a scannable
    pub fn notify_offline(&mut self, scannable: RecordId, offline: bool) -> Result<()> {
        let subject = AlertSubject::Record(scannable);
        let existing = self.tables.active_alert(subject, AlertKind::Offline);
        match (offline, existing) {
            (true, None) => {
                let alert_id = self.tables.create_alert(
                    subject,
                    AlertKind::Offline,
                    OFFLINE_ALERT,
                    None,
                    Severity::Error,
                );
                warn!(%scannable, "Scannable went offline");
                self.emit(ResourceEvent::AlertRaised {
                    alert_id,
                    record_id: Some(scannable),
                    alert_class: OFFLINE_ALERT.to_string(),
                });
            }
            (true, Some(alert_id)) => {
                if let Some(row) = self.tables.alert_states.get_mut(&alert_id) {
                    row.end = Utc::now();
                }
            }
            (false, Some(alert_id)) => {
                info!(%scannable, "Scannable back online");
                self.lower_alert(alert_id);
            }
            (false, None) => {}
        }
        Ok(())
    }

    /// End an alert, drop its propagations and announce it
    pub fn lower_alert(&mut self, alert_id: AlertId) {
        let alert_class = self
            .tables
            .alert_states
            .get(&alert_id)
            .map(|a| a.alert_class.clone())
            .unwrap_or_default();
        self.tables.end_alert(alert_id);
        debug!(alert = %alert_id, %alert_class, "Lowered alert");
        self.emit(ResourceEvent::AlertLowered {
            alert_id,
            alert_class,
        });
    }

    /// End every active alert whose subject is one of `records`
    pub fn end_alerts_of(&mut self, records: &BTreeSet<RecordId>) {
        self.state
            .active_alerts
            .retain(|(record, _), _| !records.contains(record));
        let ending: Vec<AlertId> = self
            .tables
            .alert_states
            .values()
            .filter(|a| a.active && matches!(a.subject, AlertSubject::Record(r) if records.contains(&r)))
            .map(|a| a.id)
            .collect();
        for alert_id in ending {
            self.lower_alert(alert_id);
        }
    }

    /// Keep only propagated rows whose record is still a descendant of
    /// the alert subject
    pub fn prune_propagations(&mut self) {
        let edges = &self.state.edges;
        let states = &self.tables.alert_states;
        for (alert_id, propagated) in self.tables.alert_propagated.iter_mut() {
            match states.get(alert_id).map(|a| a.subject) {
                Some(AlertSubject::Record(subject)) => {
                    let reachable = edges.descendants(subject);
                    propagated.retain(|r| reachable.contains(r));
                }
                _ => propagated.clear(),
            }
        }
        self.tables.alert_propagated.retain(|_, p| !p.is_empty());
    }
}
