//! Test fixtures: plugin modules and a manager harness

use crate::error::{Error, Result};
use crate::jobs::{JobRequest, QueuedJobScheduler};
use crate::manager::{ResourceManager, SessionKey};
use crate::metamodel::{
    builtin, AlertCondition, AttrMap, AttributeSpec, ClassBuilder, LocalHandle, Relation,
    ResourceClass, Severity,
};
use crate::plugin::{Plugin, PluginManager, PluginModule, ReportedResource, ScanContext};
use crate::plugins;
use crate::store::{RecordId, Store, VolumeNodeRow, VolumeRow};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Plugin that reports nothing
pub struct NullPlugin;

impl NullPlugin {
    pub fn boxed() -> Box<dyn Plugin> {
        Box::new(NullPlugin)
    }
}

impl Plugin for NullPlugin {
    fn initial_scan(&mut self, _ctx: &mut ScanContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Plugin whose scans always fail
pub struct FailingPlugin;

impl FailingPlugin {
    pub fn boxed() -> Box<dyn Plugin> {
        Box::new(FailingPlugin)
    }
}

impl Plugin for FailingPlugin {
    fn initial_scan(&mut self, _ctx: &mut ScanContext<'_>) -> Result<()> {
        Err(Error::Internal("controller unreachable".into()))
    }
}

/// Controller exposing LUNs presented to hosts
pub fn subscription_plugin() -> PluginModule {
    PluginModule::new("subscription_plugin")
        .with_plugin(NullPlugin::boxed)
        .with_class(
            ClassBuilder::new("Controller")
                .extends("Controller")
                .global_id(&["address"]),
        )
        .with_class(
            ClassBuilder::new("Lun")
                .extends("StorageResource")
                .global_id(&["lun_id"])
                .attribute(AttributeSpec::string("lun_id"))
                .attribute(AttributeSpec::bytes("size").optional()),
        )
        .with_class(
            ClassBuilder::new("Presentation")
                .extends("StorageResource")
                .global_id(&["lun_id", "host_id", "path"])
                .attribute(AttributeSpec::integer("host_id"))
                .attribute(AttributeSpec::posix_path("path"))
                .attribute(AttributeSpec::string("lun_id"))
                .relation(Relation::provide("DeviceNode", &["host_id", "path"]))
                .relation(Relation::subscribe("Lun", &["lun_id"])),
        )
        .with_class(
            ClassBuilder::new("Vm")
                .extends("VirtualMachine")
                .global_id(&["address"]),
        )
}

/// Controller with alert conditions
pub fn alert_plugin() -> PluginModule {
    PluginModule::new("alert_plugin")
        .with_plugin(NullPlugin::boxed)
        .with_class(
            ClassBuilder::new("Controller")
                .extends("Controller")
                .global_id(&["address"])
                .attribute(AttributeSpec::integer("temperature").optional())
                .attribute(AttributeSpec::string("status").optional())
                .attribute(AttributeSpec::string("multi_status").optional())
                .alert(
                    AlertCondition::value("status")
                        .states(Severity::Warning, &["FAILED"])
                        .states(Severity::Error, &["BADLY_FAILED"]),
                )
                .alert(
                    AlertCondition::value("multi_status")
                        .with_id("multi_status_failed_1")
                        .states(Severity::Error, &["FAIL1"]),
                )
                .alert(
                    AlertCondition::value("multi_status")
                        .with_id("multi_status_failed_2")
                        .states(Severity::Warning, &["FAIL1"]),
                )
                .alert(
                    AlertCondition::upper_bound("temperature")
                        .with_id("temperature_high")
                        .bound(Severity::Warning, 85)
                        .bound(Severity::Error, 95),
                )
                .alert(
                    AlertCondition::lower_bound("temperature")
                        .with_id("temperature_low")
                        .bound(Severity::Info, 0),
                ),
        )
        .with_class(
            ClassBuilder::new("Lun")
                .extends("StorageResource")
                .global_id(&["lun_id"])
                .attribute(AttributeSpec::string("lun_id")),
        )
}

/// Controller that can never be scanned
pub fn failing_plugin() -> PluginModule {
    PluginModule::new("failing_plugin")
        .with_plugin(FailingPlugin::boxed)
        .with_class(
            ClassBuilder::new("Controller")
                .extends("Controller")
                .global_id(&["address"]),
        )
}

/// Builtin plugin modules plus the fixtures
pub fn catalog() -> Vec<PluginModule> {
    let mut catalog = plugins::catalog();
    catalog.push(subscription_plugin());
    catalog.push(alert_plugin());
    catalog.push(failing_plugin());
    catalog
}

pub const INSTALLED: [&str; 5] = [
    "linux",
    "linux_network",
    "subscription_plugin",
    "alert_plugin",
    "failing_plugin",
];

// =============================================================================
// Harness
// =============================================================================

/// A resource manager over an in-memory store with every fixture loaded
pub struct Harness {
    pub plugins: Arc<PluginManager>,
    pub manager: Arc<ResourceManager>,
    pub jobs: Arc<QueuedJobScheduler>,
    pub job_requests: mpsc::UnboundedReceiver<JobRequest>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(Store::in_memory()))
    }

    pub fn with_store(store: Arc<Store>) -> Self {
        let installed: Vec<String> = INSTALLED.iter().map(|s| s.to_string()).collect();
        let plugins = Arc::new(PluginManager::load_plugins(&catalog(), &installed, store.clone()).unwrap());
        assert!(plugins.errored_plugins().is_empty(), "{:?}", plugins.errored_plugins());
        let (jobs, job_requests) = QueuedJobScheduler::new();
        let jobs = Arc::new(jobs);
        let manager = Arc::new(ResourceManager::new(plugins.registry(), store, jobs.clone()));
        Self {
            plugins,
            manager,
            jobs,
            job_requests,
        }
    }

    pub fn class(&self, module: &str, name: &str) -> Arc<ResourceClass> {
        self.plugins.get_plugin_resource_class(module, name).unwrap().0
    }

    pub fn root(&self, module: &str, name: &str, attrs: AttrMap) -> RecordId {
        self.manager
            .create_root_resource(&self.class(module, name), attrs)
            .unwrap()
    }

    /// Host-side scannable of the linux plugin on a host
    pub fn host(&self, host_id: i64) -> RecordId {
        self.agent_root(host_id, "linux")
    }

    pub fn agent_root(&self, host_id: i64, plugin_name: &str) -> RecordId {
        let class = self
            .plugins
            .registry()
            .lookup(builtin::BUILTIN_MODULE, "PluginAgentResources")
            .cloned()
            .unwrap();
        self.manager
            .create_root_resource(
                &class,
                crate::attrs! { "host_id" => host_id, "plugin_name" => plugin_name },
            )
            .unwrap()
    }

    pub fn controller(&self, module: &str, address: &str) -> RecordId {
        self.root(module, "Controller", crate::attrs! { "address" => address })
    }

    pub fn resource(
        &self,
        handle: u64,
        module: &str,
        name: &str,
        attrs: AttrMap,
        parents: &[u64],
    ) -> ReportedResource {
        let class = self.class(module, name);
        let attributes = attrs
            .into_iter()
            .map(|(k, v)| {
                let v = class.prepare(&k, v).unwrap();
                (k, v)
            })
            .collect();
        ReportedResource {
            handle: LocalHandle(handle),
            class,
            attributes,
            parents: parents.iter().copied().map(LocalHandle).collect(),
        }
    }

    /// Open a session; the scannable is reported as handle 1
    pub fn open(&self, scannable: RecordId, resources: Vec<ReportedResource>) -> SessionKey {
        self.try_open(scannable, resources).unwrap()
    }

    pub fn try_open(&self, scannable: RecordId, resources: Vec<ReportedResource>) -> Result<SessionKey> {
        let root = self.manager.get_resource(scannable)?;
        let mut reported = vec![ReportedResource {
            handle: LocalHandle(1),
            class: root.class,
            attributes: root.attributes,
            parents: Vec::new(),
        }];
        reported.extend(resources);
        self.manager
            .session_open(scannable, &reported, Duration::from_secs(5))
    }

    pub fn find(&self, module: &str, name: &str, key: &str, value: impl Into<crate::metamodel::AttrValue>) -> Option<RecordId> {
        let qualified = format!("{}.{}", module, name);
        self.manager
            .records_with_attribute(&qualified, key, &value.into())
            .first()
            .copied()
    }

    pub fn record_ids(&self) -> BTreeSet<RecordId> {
        self.manager.store().read(|t| t.records.keys().copied().collect())
    }

    pub fn volumes(&self) -> Vec<VolumeRow> {
        self.manager.store().read(|t| t.volumes.values().cloned().collect())
    }

    pub fn volume_nodes(&self) -> Vec<VolumeNodeRow> {
        self.manager
            .store()
            .read(|t| t.volume_nodes.values().cloned().collect())
    }
}
