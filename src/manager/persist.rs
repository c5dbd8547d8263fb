//! Persisting newly reported resources

use super::events::ResourceEvent;
use super::indices::SessionKey;
use super::txn::Txn;
use crate::error::Result;
use crate::metamodel::{builtin, id_str, AttrMap, AttrValue, LocalHandle, ResourceRef};
use crate::plugin::ReportedResource;
use crate::store::{LearnEventRow, RecordId};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Order resources so every resource follows the ones its reference
/// attributes point at
fn order_by_references<'r>(resources: &'r [ReportedResource]) -> Vec<&'r ReportedResource> {
    let by_handle: HashMap<LocalHandle, &ReportedResource> =
        resources.iter().map(|r| (r.handle, r)).collect();
    let mut ordered = Vec::with_capacity(resources.len());
    let mut visited = HashSet::new();

    fn visit<'r>(
        resource: &'r ReportedResource,
        by_handle: &HashMap<LocalHandle, &'r ReportedResource>,
        visited: &mut HashSet<LocalHandle>,
        ordered: &mut Vec<&'r ReportedResource>,
    ) {
        if !visited.insert(resource.handle) {
            return;
        }
        for value in resource.attributes.values() {
            if let AttrValue::Reference(ResourceRef::Local(h)) = value {
                if let Some(target) = by_handle.get(h) {
                    visit(target, by_handle, visited, ordered);
                }
            }
        }
        ordered.push(resource);
    }

    for resource in resources {
        visit(resource, &by_handle, &mut visited, &mut ordered);
    }
    ordered
}

impl Txn<'_> {
    /// Persist resources not yet mapped in the session; returns created records
    pub fn persist_new_resources(
        &mut self,
        key: &SessionKey,
        resources: &[ReportedResource],
    ) -> Result<Vec<RecordId>> {
        let scannable = key.scannable_id;
        let mut created: Vec<RecordId> = Vec::new();
        let mut new_logical_drives: Vec<RecordId> = Vec::new();
        let mut persisted: Vec<(RecordId, AttrMap)> = Vec::new();

        for resource in order_by_references(resources) {
            if self.global_id(key, resource.handle)?.is_some() {
                continue;
            }
            let class = resource.class.clone();
            let attrs = self.globalize(key, &resource.attributes)?;
            let id_string = id_str(&class.id_tuple(&attrs)?)?;
            let scope = class.is_scoped().then_some(scannable);

            let (record, is_new) = self.tables.get_or_create_record(class.id, &id_string, scope);
            self.session_mut(key)?.map(resource.handle, record);
            self.state.class_index.insert(record, class.id);
            self.state
                .label_cache
                .insert(record, class.instance_label(&attrs));
            self.state
                .subscribers
                .add_resource(self.registry, record, &class, &attrs);

            if class.is_global() && record != scannable {
                if let Some(row) = self.tables.record_mut(record) {
                    row.reported_by.insert(scannable);
                }
            }
            self.write_attrs(record, &class, &attrs)?;

            if is_new {
                info!(
                    record = %record,
                    class = %class.name,
                    label = %class.instance_label(&attrs),
                    "Created storage resource"
                );
                created.push(record);
                if class.is_a(builtin::LOGICAL_DRIVE) {
                    new_logical_drives.push(record);
                }
                self.emit(ResourceEvent::RecordCreated {
                    record_id: record,
                    class_name: class.name.clone(),
                });
            }
            persisted.push((record, attrs));
        }

        // Subscriber linkage for records seen for the first time
        for (record, attrs) in &persisted {
            if !created.contains(record) {
                continue;
            }
            let class = self.class_of(*record)?;
            for subscriber in self
                .state
                .subscribers
                .what_subscribes(self.registry, &class, attrs)
            {
                if subscriber != *record {
                    self.add_edge(subscriber, *record);
                }
            }
            for provider in self
                .state
                .subscribers
                .what_provides(self.registry, &class, attrs)
            {
                if provider != *record {
                    self.add_edge(*record, provider);
                }
            }
        }

        // Declared parents, for every reported resource
        for resource in resources {
            let Some(child) = self.global_id(key, resource.handle)? else {
                continue;
            };
            for parent in &resource.parents {
                match self.global_id(key, *parent)? {
                    Some(parent) => {
                        self.add_edge(child, parent);
                    }
                    None => debug!(%child, parent = %parent, "Parent not yet persisted"),
                }
            }
        }

        self.relabel_volumes_below(&new_logical_drives)?;

        if let Some(host_id) = self.session(key)?.host_id {
            let now = Utc::now();
            for record in &created {
                self.tables.learn_events.push(LearnEventRow {
                    record_id: *record,
                    host_id,
                    created_at: now,
                });
            }
        }

        Ok(created)
    }

    /// A new LogicalDrive above an existing volume's drive becomes the
    /// volume's label source when it is that drive's only LogicalDrive ancestor
    fn relabel_volumes_below(&mut self, new_logical_drives: &[RecordId]) -> Result<()> {
        for ld in new_logical_drives {
            for child in self.state.edges.get_children(*ld) {
                let Some(descendant) = self.find_descendant(child, builtin::LOGICAL_DRIVE, None)?
                else {
                    continue;
                };
                let ancestors: Vec<RecordId> = self
                    .find_ancestors(descendant, builtin::LOGICAL_DRIVE)?
                    .into_iter()
                    .filter(|a| *a != descendant)
                    .collect();
                if ancestors.len() != 1 {
                    continue;
                }
                if let Some(volume_id) = self.tables.volume_for_resource(descendant) {
                    let label = self.get_label(*ld)?;
                    if let Some(volume) = self.tables.volumes.get_mut(&volume_id) {
                        debug!(volume = %volume_id, %label, "Relabelled volume");
                        volume.label = label;
                    }
                }
            }
        }
        Ok(())
    }

    /// Ask the job scheduler for hosts backing VirtualMachine resources
    /// that do not know their host yet
    pub fn persist_created_hosts(&mut self, key: &SessionKey, resources: &[ReportedResource]) -> Result<()> {
        for resource in resources {
            if !resource.class.is_a(builtin::VIRTUAL_MACHINE) {
                continue;
            }
            let Some(record) = self.global_id(key, resource.handle)? else {
                continue;
            };
            if !self.read_attr(record, "host_id")?.is_null() {
                continue;
            }
            let address = self.read_attr(record, "address")?;
            let Some(address) = address.as_str() else {
                continue;
            };
            let host_id = match self.jobs.find_host_by_address(address) {
                Some(id) => id,
                None => {
                    info!(%address, vm = %record, "Requesting host for virtual machine");
                    self.jobs.create_host(address)?
                }
            };
            self.tables
                .set_serialized(record, "host_id", AttrValue::Integer(host_id).to_json().to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::metamodel::{AttributeSpec, ClassBuilder, ResourceClass};
    use crate::store::ClassId;
    use std::sync::Arc;

    #[test]
    fn test_order_by_references() {
        let class: Arc<ResourceClass> = Arc::new(
            ClassBuilder::new("Part")
                .global_id(&["name"])
                .attribute(AttributeSpec::string("name"))
                .attribute(AttributeSpec::reference("container").optional())
                .compile(ClassId(1), "test", None)
                .unwrap(),
        );
        let resource = |h: u64, container: Option<u64>| ReportedResource {
            handle: LocalHandle(h),
            class: class.clone(),
            attributes: attrs! { "name" => format!("p{}", h), "container" => container.map(LocalHandle) },
            parents: vec![],
        };
        let resources = vec![resource(1, Some(2)), resource(2, Some(3)), resource(3, None)];
        let order: Vec<u64> = order_by_references(&resources)
            .iter()
            .map(|r| r.handle.0)
            .collect();
        assert_eq!(order, vec![3, 2, 1]);
    }
}
