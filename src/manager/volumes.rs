//! Volume and VolumeNode derivation for host-side sessions

use super::events::ResourceEvent;
use super::indices::SessionKey;
use super::txn::Txn;
use crate::error::Result;
use crate::metamodel::builtin;
use crate::store::{RecordId, VolumeId, VolumeNodeId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

const MAPPER_PREFIX: &str = "/dev/mapper/";

/// A device node competing for the VolumeNode of a volume on one host
#[derive(Debug, Clone)]
enum Candidate {
    Unassigned { node: RecordId, path: String },
    Existing { volume_node: VolumeNodeId, path: String },
}

impl Candidate {
    fn path(&self) -> &str {
        match self {
            Candidate::Unassigned { path, .. } | Candidate::Existing { path, .. } => path,
        }
    }
}

impl Txn<'_> {
    /// Bring the Volume/VolumeNode projection in line with the device
    /// nodes currently reported by a host-side scannable
    pub fn persist_lun_updates(&mut self, key: &SessionKey) -> Result<()> {
        let Some(host_id) = self.session(key)?.host_id else {
            return Ok(());
        };
        let scannable = key.scannable_id;

        let mut scope_nodes = BTreeSet::new();
        for record in self.tables.records_scoped_to(scannable) {
            if self.class_of(record)?.is_a(builtin::DEVICE_NODE) {
                scope_nodes.insert(record);
            }
        }
        let usable: BTreeSet<RecordId> = scope_nodes
            .iter()
            .copied()
            .filter(|n| !self.state.edges.has_children(*n))
            .collect();
        let unassigned: Vec<RecordId> = usable
            .iter()
            .copied()
            .filter(|n| self.tables.volume_node_for_resource(*n).is_none())
            .collect();

        let mut by_volume: BTreeMap<VolumeId, Vec<RecordId>> = BTreeMap::new();
        for node in unassigned {
            let Some(ld) = self.find_ancestor(node, builtin::LOGICAL_DRIVE)? else {
                info!(node = %node, "Device node has no logical drive ancestor");
                continue;
            };
            let volume = match self.tables.volume_for_resource(ld) {
                Some(volume) => volume,
                None => match self.create_volume_for(ld)? {
                    Some(volume) => volume,
                    None => continue,
                },
            };
            by_volume.entry(volume).or_default().push(node);
        }

        for (volume, nodes) in by_volume {
            let mut candidates = Vec::new();
            for node in nodes {
                let path = self.read_attr(node, "path")?;
                candidates.push(Candidate::Unassigned {
                    node,
                    path: path.as_str().unwrap_or_default().to_string(),
                });
            }
            for volume_node in self.tables.nodes_of_volume(volume) {
                if let Some(row) = self.tables.volume_nodes.get(&volume_node) {
                    if row.host_id == host_id {
                        candidates.push(Candidate::Existing {
                            volume_node,
                            path: row.path.clone(),
                        });
                    }
                }
            }

            let mapper: Vec<usize> = candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| c.path().starts_with(MAPPER_PREFIX))
                .map(|(i, _)| i)
                .collect();
            if candidates.len() > 1 && mapper.len() == 1 {
                let winner = candidates.swap_remove(mapper[0]);
                for loser in candidates.drain(..) {
                    if let Candidate::Existing { volume_node, path } = loser {
                        debug!(%path, "Preferring multipath device node");
                        self.remove_volume_node(volume_node, false)?;
                    }
                }
                candidates.push(winner);
            }

            for candidate in candidates {
                let Candidate::Unassigned { node, path } = candidate else {
                    continue;
                };
                if self.tables.volume_node_at(host_id, &path).is_some() {
                    continue;
                }
                let id = self
                    .tables
                    .create_volume_node(volume, host_id, &path, node);
                info!(volume = %volume, host_id, %path, "Created volume node");
                self.emit(ResourceEvent::VolumeNodeCreated {
                    volume_node_id: id,
                    volume_id: volume,
                    host_id,
                    path,
                });
            }
        }

        // Nodes that stopped being leaves lose their VolumeNode
        let stale: Vec<VolumeNodeId> = scope_nodes
            .difference(&usable)
            .filter_map(|n| self.tables.volume_node_for_resource(*n))
            .collect();
        for volume_node in stale {
            self.remove_volume_node(volume_node, true)?;
        }
        Ok(())
    }

    /// Create the Volume for an unoccupied LogicalDrive
    fn create_volume_for(&mut self, ld: RecordId) -> Result<Option<VolumeId>> {
        if let Some(occupier) =
            self.find_descendant(ld, builtin::LOGICAL_DRIVE_OCCUPIER, Some(builtin::LOGICAL_DRIVE))?
        {
            debug!(logical_drive = %ld, %occupier, "Logical drive is occupied");
            return Ok(None);
        }

        let ancestors: Vec<RecordId> = self
            .find_ancestors(ld, builtin::LOGICAL_DRIVE)?
            .into_iter()
            .filter(|a| *a != ld)
            .collect();
        let label_source = match ancestors.as_slice() {
            [ancestor]
                if !self.class_of(ld)?.is_a(builtin::LOGICAL_DRIVE_SLICE)
                    && !self.class_of(*ancestor)?.is_a(builtin::LOGICAL_DRIVE_SLICE) =>
            {
                *ancestor
            }
            _ => ld,
        };
        let label = self.get_label(label_source)?;

        let size = self.read_attr(ld, "size")?.as_i64();
        let filesystem_type = self
            .read_attr(ld, "filesystem_type")?
            .as_str()
            .map(str::to_string);
        let usable_for_lustre = self
            .read_attr(ld, "usable_for_lustre")?
            .as_bool()
            .unwrap_or(true);

        let volume = self
            .tables
            .create_volume(ld, size, label.clone(), filesystem_type, usable_for_lustre);
        info!(volume = %volume, logical_drive = %ld, %label, "Created volume");
        self.emit(ResourceEvent::VolumeCreated {
            volume_id: volume,
            storage_resource: ld,
            label,
        });
        Ok(Some(volume))
    }

    pub fn remove_volume_node(&mut self, volume_node: VolumeNodeId, try_remove_volume: bool) -> Result<()> {
        let Some(row) = self.tables.remove_volume_node(volume_node) else {
            return Ok(());
        };
        info!(volume_node = %volume_node, path = %row.path, host_id = row.host_id, "Removed volume node");
        self.emit(ResourceEvent::VolumeNodeRemoved {
            volume_node_id: volume_node,
        });
        if try_remove_volume {
            self.try_removing_volume(row.volume_id)?;
        }
        Ok(())
    }

    /// Delete a Volume once no VolumeNodes remain, unless a higher layer claimed it
    pub fn try_removing_volume(&mut self, volume: VolumeId) -> Result<()> {
        if !self.tables.nodes_of_volume(volume).is_empty() {
            return Ok(());
        }
        match self.tables.volumes.get(&volume) {
            None => {}
            Some(row) if row.claimed => {
                debug!(volume = %volume, "Keeping claimed volume without nodes");
            }
            Some(_) => {
                self.tables.remove_volume(volume);
                info!(volume = %volume, "Removed volume");
                self.emit(ResourceEvent::VolumeRemoved { volume_id: volume });
            }
        }
        Ok(())
    }
}
