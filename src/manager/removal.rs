//! Cascade removal and culling of unreported resources

use super::events::ResourceEvent;
use super::indices::SessionKey;
use super::txn::Txn;
use crate::error::Result;
use crate::store::{AlertKind, AlertSubject, RecordId, VolumeNodeId};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

impl Txn<'_> {
    /// Remove records previously reported by the session's scannable that
    /// are absent from `reported`
    pub fn cull(&mut self, key: &SessionKey, reported: &BTreeSet<RecordId>) -> Result<()> {
        let scannable = key.scannable_id;

        // Deleting one record may cascade into others, so re-read until stable
        let mut rounds = 0;
        loop {
            let stale: Vec<RecordId> = self
                .tables
                .records_scoped_to(scannable)
                .into_iter()
                .filter(|r| !reported.contains(r))
                .collect();
            let Some(record) = stale.first().copied() else {
                break;
            };
            rounds += 1;
            if rounds > self.tables.records.len() + 1 {
                warn!(%scannable, "Culling did not converge");
                break;
            }
            debug!(%scannable, %record, "Culling scoped resource");
            self.delete_resource(record)?;
        }

        for record in self.tables.records_reported_by(scannable) {
            if reported.contains(&record) {
                continue;
            }
            let orphaned = match self.tables.record_mut(record) {
                Some(row) => {
                    row.reported_by.remove(&scannable);
                    row.reported_by.is_empty()
                }
                None => continue,
            };
            if orphaned {
                debug!(%scannable, %record, "Culling resource with no reporters");
                self.delete_resource(record)?;
            }
        }
        Ok(())
    }

    /// Delete a record together with everything that depends on it
    pub fn delete_resource(&mut self, record: RecordId) -> Result<()> {
        if self.tables.record(record).is_none() {
            return Ok(());
        }

        // Phase 1: scope and reported-by dependents of scannables
        let mut roots = Vec::new();
        let class = self.class_of(record)?;
        if class.is_scannable() || class.is_hostside() {
            roots.extend(self.tables.records_scoped_to(record));
            for reported in self.tables.records_reported_by(record) {
                let Some(row) = self.tables.record_mut(reported) else {
                    continue;
                };
                row.reported_by.remove(&record);
                let orphaned = row.reported_by.is_empty() && row.storage_id_scope.is_none();
                if orphaned && !self.class_of(reported)?.is_scannable() {
                    roots.push(reported);
                }
            }
            self.tables.alert_states.retain(|_, a| {
                !(a.kind == AlertKind::Offline && a.subject == AlertSubject::Record(record))
            });
        }
        roots.push(record);

        // Phase 2: referrers, visited once each, ordered before their targets
        let mut visited = BTreeSet::new();
        let mut victims = Vec::new();
        for root in roots {
            self.collect_referrers(root, &mut visited, &mut victims);
        }
        let victim_set: BTreeSet<RecordId> = victims.iter().copied().collect();
        info!(%record, count = victims.len(), "Removing storage resources");

        let mut class_names = Vec::with_capacity(victims.len());
        for victim in &victims {
            class_names.push(self.class_of(*victim)?.name.clone());
            self.remove_network_projection(*victim)?;
        }

        self.tables
            .learn_events
            .retain(|e| !victim_set.contains(&e.record_id));
        for row in self.tables.records.values_mut() {
            row.parents.retain(|p| !victim_set.contains(p));
        }

        let orphan_nodes: Vec<VolumeNodeId> = victim_set
            .iter()
            .filter_map(|v| self.tables.volume_node_for_resource(*v))
            .collect();
        for volume_node in orphan_nodes {
            self.remove_volume_node(volume_node, true)?;
        }
        let orphan_volumes: Vec<_> = victim_set
            .iter()
            .filter_map(|v| self.tables.volume_for_resource(*v))
            .collect();
        for volume in orphan_volumes {
            self.try_removing_volume(volume)?;
            self.tables.detach_volume(volume);
        }

        for propagated in self.tables.alert_propagated.values_mut() {
            propagated.retain(|r| !victim_set.contains(r));
        }
        self.end_alerts_of(&victim_set);

        for victim in &victims {
            self.state.subscribers.remove_resource(*victim);
            self.state.class_index.remove(victim);
            self.state.edges.remove_node(*victim);
            self.state.label_cache.remove(victim);
        }
        let dropped: Vec<RecordId> = self
            .state
            .sessions
            .keys()
            .copied()
            .filter(|s| victim_set.contains(s))
            .collect();
        for scannable in dropped {
            warn!(%scannable, "Dropping session of removed scannable");
            self.state.sessions.remove(&scannable);
            self.emit(ResourceEvent::SessionClosed {
                scannable_id: scannable,
            });
        }
        for session in self.state.sessions.values_mut() {
            for victim in &victims {
                session.forget_global(*victim);
            }
        }

        for (victim, class_name) in victims.into_iter().zip(class_names) {
            self.tables.clear_references_to(victim);
            self.tables.delete_record(victim);
            info!(record = %victim, class = %class_name, "Removed storage resource");
            self.emit(ResourceEvent::RecordRemoved {
                record_id: victim,
                class_name,
            });
        }
        self.prune_propagations();
        Ok(())
    }

    fn collect_referrers(
        &self,
        record: RecordId,
        visited: &mut BTreeSet<RecordId>,
        victims: &mut Vec<RecordId>,
    ) {
        if !visited.insert(record) {
            return;
        }
        for referrer in self.tables.referrers_of(record) {
            self.collect_referrers(referrer, visited, victims);
        }
        victims.push(record);
    }
}
