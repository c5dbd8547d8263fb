//! Plugin Runtime
//!
//! A [`PluginInstance`] binds one plugin to one scannable record. Plugin
//! callbacks run under the instance lock against a [`ScanContext`]; the
//! deltas they accumulate are then committed to the resource manager.

use super::api::Plugin;
use super::index::{LocalResource, ReportedResource, ResourceIndex};
use super::registry::ClassRegistry;
use crate::error::{Error, Result};
use crate::manager::{
    AlertNotice, ParentChange, ResourceManager, SessionKey, SessionUpdate, StoredResource,
};
use crate::metamodel::{
    new_auto_id, AttrMap, AttrValue, IdentifierSpec, LocalHandle, ResourceClass, Severity,
    AUTO_ID_ATTR,
};
use crate::store::RecordId;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn};

// =============================================================================
// Session State
// =============================================================================

/// Alert identity within one plugin instance. Every severity bound of a
/// condition maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AlertKey {
    handle: LocalHandle,
    attribute: Option<String>,
    alert_class: String,
}

/// One alert transition to commit
#[derive(Debug, Clone, PartialEq, Eq)]
struct AlertDelta {
    key: AlertKey,
    severity: Severity,
    active: bool,
}

/// Everything a plugin callback mutates
#[derive(Debug)]
struct SessionState {
    index: ResourceIndex,
    root: LocalHandle,
    next_handle: u64,
    update_period: Duration,
    calc_changes_delta: bool,
    delta_new: Vec<LocalHandle>,
    delta_delete_local: Vec<LocalHandle>,
    delta_delete_global: Vec<LocalHandle>,
    /// Effective severity of each raised alert
    alerts: HashMap<AlertKey, Severity>,
    delta_alerts: Vec<AlertDelta>,
}

impl SessionState {
    fn new(root: &StoredResource, update_period: Duration) -> Result<Self> {
        let mut index = ResourceIndex::new();
        let handle = LocalHandle(1);
        index.add(LocalResource::new(
            handle,
            root.class.clone(),
            root.attributes.clone(),
            Vec::new(),
            true,
        ))?;
        Ok(Self {
            index,
            root: handle,
            next_handle: 2,
            update_period,
            calc_changes_delta: true,
            delta_new: Vec::new(),
            delta_delete_local: Vec::new(),
            delta_delete_global: Vec::new(),
            alerts: HashMap::new(),
            delta_alerts: Vec::new(),
        })
    }

    fn allocate_handle(&mut self) -> LocalHandle {
        let handle = LocalHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn clear_deltas(&mut self) {
        self.delta_new.clear();
        self.delta_delete_local.clear();
        self.delta_delete_global.clear();
        for resource in self.index.all_mut() {
            resource.take_deltas();
        }
    }

    /// Evaluate alert conditions over every indexed resource, recording changes.
    ///
    /// Tests sharing a key collapse to the highest active severity.
    fn check_alert_conditions(&mut self) {
        let mut effective: IndexMap<AlertKey, Option<Severity>> = IndexMap::new();
        for resource in self.index.all() {
            for test in resource.class().evaluate_alerts(resource.attributes()) {
                let key = AlertKey {
                    handle: resource.handle(),
                    attribute: Some(test.attribute),
                    alert_class: test.alert_class,
                };
                let current = effective.entry(key).or_insert(None);
                if test.active && current.map_or(true, |s| test.severity > s) {
                    *current = Some(test.severity);
                }
            }
        }
        for (key, severity) in effective {
            self.set_alert(key, severity);
        }
    }

    /// Record the effective severity of `key`. A severity change lowers the
    /// old alert and raises the new one.
    fn set_alert(&mut self, key: AlertKey, severity: Option<Severity>) {
        let previous = self.alerts.get(&key).copied();
        if previous == severity {
            return;
        }
        if let Some(old) = previous {
            self.delta_alerts.push(AlertDelta {
                key: key.clone(),
                severity: old,
                active: false,
            });
        }
        match severity {
            Some(new) => {
                self.delta_alerts.push(AlertDelta {
                    key: key.clone(),
                    severity: new,
                    active: true,
                });
                self.alerts.insert(key, new);
            }
            None => {
                self.alerts.remove(&key);
            }
        }
    }

    /// Changed alerts in commit order: deactivations, then activations by
    /// descending severity, each group in declaration order
    fn take_alert_deltas(&mut self) -> Vec<AlertDelta> {
        let mut deltas = std::mem::take(&mut self.delta_alerts);
        deltas.sort_by_key(|d| (d.active, Reverse(d.severity)));
        deltas
    }
}

// =============================================================================
// Scan Context
// =============================================================================

/// Plugin-facing API over the instance's resource index
pub struct ScanContext<'a> {
    state: &'a mut SessionState,
    registry: &'a ClassRegistry,
    module: &'a str,
}

impl<'a> ScanContext<'a> {
    fn new(state: &'a mut SessionState, registry: &'a ClassRegistry, module: &'a str) -> Self {
        Self {
            state,
            registry,
            module,
        }
    }

    fn class(&self, name: &str) -> Result<Arc<ResourceClass>> {
        self.registry
            .resolve(self.module, name)
            .cloned()
            .ok_or_else(|| Error::PluginNotFound(format!("{}.{}", self.module, name)))
    }

    /// Handle of the scannable this instance is bound to
    pub fn root(&self) -> LocalHandle {
        self.state.root
    }

    /// Read an attribute of the root resource
    pub fn root_attribute(&self, name: &str) -> Result<AttrValue> {
        self.attribute(self.state.root, name)
    }

    pub fn get(&self, handle: LocalHandle) -> Option<&LocalResource> {
        self.state.index.resource(handle)
    }

    pub fn attribute(&self, handle: LocalHandle, name: &str) -> Result<AttrValue> {
        self.get(handle)
            .ok_or_else(|| Error::Internal(format!("no local resource {}", handle)))?
            .get(name)
    }

    /// Return the resource with these identifying attributes, creating it if
    /// needed. Existing resources get their attributes updated and parents merged.
    pub fn update_or_create(
        &mut self,
        class_name: &str,
        parents: &[LocalHandle],
        attrs: AttrMap,
    ) -> Result<(LocalHandle, bool)> {
        let class = self.class(class_name)?;
        let mut prepared = AttrMap::new();
        for (name, value) in attrs {
            let value = class.prepare(&name, value)?;
            prepared.insert(name, value);
        }
        for parent in parents {
            if !self.state.index.contains(*parent) {
                return Err(Error::ResourceNotFound {
                    class_name: class.name.clone(),
                    id: format!("parent {}", parent),
                });
            }
        }

        let auto = matches!(class.identifier, Some(IdentifierSpec::Auto));
        if !(auto && !prepared.contains_key(AUTO_ID_ATTR)) {
            let id_tuple = class.id_tuple(&prepared)?;
            match self.state.index.get(&class, &id_tuple) {
                Ok(handle) => {
                    for (name, value) in prepared {
                        self.state.index.set_attribute(handle, &name, value)?;
                    }
                    self.merge_parents(handle, parents)?;
                    return Ok((handle, false));
                }
                Err(Error::ResourceNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        } else {
            prepared.insert(AUTO_ID_ATTR.to_string(), AttrValue::String(new_auto_id()));
        }

        class.validate(&prepared)?;
        let handle = self.state.allocate_handle();
        self.state.index.add(LocalResource::new(
            handle,
            class.clone(),
            prepared,
            parents.to_vec(),
            self.state.calc_changes_delta,
        ))?;
        self.state.delta_new.push(handle);
        debug!(class = %class.name, handle = %handle, "Created local resource");
        Ok((handle, true))
    }

    fn merge_parents(&mut self, handle: LocalHandle, parents: &[LocalHandle]) -> Result<()> {
        for parent in parents {
            self.add_parent(handle, *parent)?;
        }
        Ok(())
    }

    /// Remove a resource; it is reported as a scoped or global deletion
    pub fn remove(&mut self, handle: LocalHandle) -> Result<()> {
        if handle == self.state.root {
            return Err(Error::Internal("cannot remove the root resource".into()));
        }
        let resource = self
            .state
            .index
            .remove(handle)
            .ok_or_else(|| Error::Internal(format!("no local resource {}", handle)))?;
        for other in self.state.index.all_mut() {
            if other.parents().contains(&handle) {
                other.remove_parent(handle);
            }
        }
        // Never pushed to the manager, nothing to delete there
        if let Some(pos) = self.state.delta_new.iter().position(|h| *h == handle) {
            self.state.delta_new.remove(pos);
            return Ok(());
        }
        if resource.class().is_scoped() {
            self.state.delta_delete_local.push(handle);
        } else {
            self.state.delta_delete_global.push(handle);
        }
        Ok(())
    }

    /// Remove the resource with these identifying attributes, if present
    pub fn remove_by_attr(&mut self, class_name: &str, attrs: AttrMap) -> Result<bool> {
        let class = self.class(class_name)?;
        let id_tuple = class.id_tuple(&attrs)?;
        match self.state.index.get(&class, &id_tuple) {
            Ok(handle) => {
                self.remove(handle)?;
                Ok(true)
            }
            Err(Error::ResourceNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resources of exactly `class_name` matching the given identifier attributes
    pub fn find_by_attr(&self, class_name: &str, attrs: &AttrMap) -> Result<Vec<LocalHandle>> {
        let class = self.class(class_name)?;
        Ok(self.state.index.find_by_attr(&class, attrs))
    }

    pub fn set_attribute(
        &mut self,
        handle: LocalHandle,
        name: &str,
        value: impl Into<AttrValue>,
    ) -> Result<()> {
        let class = self
            .get(handle)
            .map(|r| r.class().clone())
            .ok_or_else(|| Error::Internal(format!("no local resource {}", handle)))?;
        let value = class.prepare(name, value.into())?;
        self.state.index.set_attribute(handle, name, value)
    }

    pub fn add_parent(&mut self, child: LocalHandle, parent: LocalHandle) -> Result<()> {
        if child == parent {
            return Err(Error::Internal(format!("{} cannot be its own parent", child)));
        }
        if !self.state.index.contains(parent) {
            return Err(Error::Internal(format!("no local resource {}", parent)));
        }
        self.state
            .index
            .resource_mut(child)
            .ok_or_else(|| Error::Internal(format!("no local resource {}", child)))?
            .add_parent(parent);
        Ok(())
    }

    pub fn remove_parent(&mut self, child: LocalHandle, parent: LocalHandle) -> Result<()> {
        self.state
            .index
            .resource_mut(child)
            .ok_or_else(|| Error::Internal(format!("no local resource {}", child)))?
            .remove_parent(parent);
        Ok(())
    }

    /// Change how often `update_scan` runs
    pub fn set_update_period(&mut self, period: Duration) {
        self.state.update_period = period;
    }

    /// Disable change detection so every set attribute is pushed
    pub fn set_calc_changes_delta(&mut self, enabled: bool) {
        self.state.calc_changes_delta = enabled;
    }

    /// Number of indexed resources, root included
    pub fn resource_count(&self) -> usize {
        self.state.index.len()
    }
}

// =============================================================================
// Plugin Instance
// =============================================================================

struct InstanceInner {
    plugin: Box<dyn Plugin>,
    state: SessionState,
    session: Option<SessionKey>,
    initialized: bool,
}

/// One plugin bound to one scannable record
pub struct PluginInstance {
    plugin_name: String,
    scannable_id: RecordId,
    manager: Arc<ResourceManager>,
    registry: Arc<ClassRegistry>,
    debug: bool,
    inner: Mutex<InstanceInner>,
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("plugin", &self.plugin_name)
            .field("scannable_id", &self.scannable_id)
            .finish()
    }
}

impl PluginInstance {
    pub fn new(
        plugin_name: impl Into<String>,
        plugin: Box<dyn Plugin>,
        scannable_id: RecordId,
        manager: Arc<ResourceManager>,
        registry: Arc<ClassRegistry>,
        update_period: Duration,
    ) -> Result<Self> {
        let root = manager.get_resource(scannable_id)?;
        let state = SessionState::new(&root, update_period)?;
        Ok(Self {
            plugin_name: plugin_name.into(),
            scannable_id,
            manager,
            registry,
            debug: false,
            inner: Mutex::new(InstanceInner {
                plugin,
                state,
                session: None,
                initialized: false,
            }),
        })
    }

    /// Log commits at info level instead of debug
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn scannable_id(&self) -> RecordId {
        self.scannable_id
    }

    pub fn update_period(&self) -> Duration {
        self.inner.lock().state.update_period
    }

    pub fn session(&self) -> Option<SessionKey> {
        self.inner.lock().session
    }

    pub fn do_initial_scan(&self) -> Result<()> {
        self.initial_populate(|plugin, ctx| plugin.initial_scan(ctx))
    }

    pub fn do_periodic_update(&self) -> Result<()> {
        self.update(|plugin, ctx| plugin.update_scan(ctx))
    }

    pub fn do_agent_session_start(&self, data: &serde_json::Value) -> Result<()> {
        let host_id = self.root_host_id()?;
        self.initial_populate(|plugin, ctx| plugin.agent_session_start(ctx, host_id, data))
    }

    pub fn do_agent_session_continue(&self, data: &serde_json::Value) -> Result<()> {
        let host_id = self.root_host_id()?;
        self.update(|plugin, ctx| plugin.agent_session_continue(ctx, host_id, data))
    }

    /// Run the plugin's teardown and close the session if one is open
    pub fn do_teardown(&self) {
        let mut inner = self.inner.lock();
        inner.plugin.teardown();
        if let Some(key) = inner.session.take() {
            self.manager.session_close(&key);
        }
    }

    fn root_host_id(&self) -> Result<i64> {
        let inner = self.inner.lock();
        let root = inner
            .state
            .index
            .resource(inner.state.root)
            .ok_or_else(|| Error::Internal("root resource missing".into()))?;
        root.get("host_id")?
            .as_i64()
            .ok_or_else(|| Error::Internal("root resource has no host_id".into()))
    }

    fn callback_error(&self, err: Error) -> Error {
        match err {
            Error::PluginCallback { .. } => err,
            other => Error::PluginCallback {
                plugin: self.plugin_name.clone(),
                reason: other.to_string(),
            },
        }
    }

    fn initial_populate<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Plugin, &mut ScanContext<'_>) -> Result<()>,
    {
        let _span = info_span!("plugin", plugin = %self.plugin_name, scannable = %self.scannable_id)
            .entered();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.initialized {
            return Err(Error::Internal(format!(
                "plugin {} for {} already initialized",
                self.plugin_name, self.scannable_id
            )));
        }
        inner.initialized = true;

        {
            let mut ctx = ScanContext::new(&mut inner.state, &self.registry, &self.plugin_name);
            callback(inner.plugin.as_mut(), &mut ctx).map_err(|e| self.callback_error(e))?;
        }

        let resources: Vec<ReportedResource> =
            inner.state.index.all().map(LocalResource::report).collect();
        let key = self.manager.session_open(
            self.scannable_id,
            &resources,
            inner.state.update_period,
        )?;
        inner.session = Some(key);
        inner.state.clear_deltas();
        self.log_commit(format_args!("Opened session with {} resources", resources.len()));

        inner.state.check_alert_conditions();
        self.commit_alerts(&key, &mut inner.state)
    }

    fn update<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Plugin, &mut ScanContext<'_>) -> Result<()>,
    {
        let _span = info_span!("plugin", plugin = %self.plugin_name, scannable = %self.scannable_id)
            .entered();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let key = inner.session.ok_or_else(|| {
            Error::Internal(format!(
                "plugin {} for {} has no open session",
                self.plugin_name, self.scannable_id
            ))
        })?;

        {
            let mut ctx = ScanContext::new(&mut inner.state, &self.registry, &self.plugin_name);
            callback(inner.plugin.as_mut(), &mut ctx).map_err(|e| self.callback_error(e))?;
        }

        let state = &mut inner.state;
        state.check_alert_conditions();

        let mut batch = SessionUpdate {
            remove_local: std::mem::take(&mut state.delta_delete_local),
            remove_global: std::mem::take(&mut state.delta_delete_global),
            ..SessionUpdate::default()
        };
        if !batch.remove_local.is_empty() {
            self.log_commit(format_args!("Removing {} scoped resources", batch.remove_local.len()));
        }
        if !batch.remove_global.is_empty() {
            self.log_commit(format_args!("Removing {} global resources", batch.remove_global.len()));
        }

        let new_handles = std::mem::take(&mut state.delta_new);
        batch.created = new_handles
            .iter()
            .filter_map(|h| state.index.resource(*h).map(LocalResource::report))
            .collect();
        if !batch.created.is_empty() {
            self.log_commit(format_args!("Adding {} resources", batch.created.len()));
        }

        for handle in state.index.handles() {
            let Some(resource) = state.index.resource_mut(handle) else {
                continue;
            };
            let (attrs, parent_changes) = resource.take_deltas();
            if new_handles.contains(&handle) {
                continue;
            }
            if !attrs.is_empty() {
                batch.attributes.push((handle, attrs));
            }
            for parent in parent_changes {
                batch.parents.push(ParentChange {
                    child: handle,
                    parent,
                    added: resource.parents().contains(&parent),
                });
            }
        }

        batch.alerts = self.alert_notices(state);
        if batch.is_empty() {
            return Ok(());
        }
        self.manager.session_apply_update(&key, &batch)
    }

    fn commit_alerts(&self, key: &SessionKey, state: &mut SessionState) -> Result<()> {
        let alerts = self.alert_notices(state);
        if alerts.is_empty() {
            return Ok(());
        }
        let batch = SessionUpdate {
            alerts,
            ..SessionUpdate::default()
        };
        self.manager.session_apply_update(key, &batch)
    }

    /// Pending alert changes of resources still in the index
    fn alert_notices(&self, state: &mut SessionState) -> Vec<AlertNotice> {
        let mut notices = Vec::new();
        for delta in state.take_alert_deltas() {
            if !state.index.contains(delta.key.handle) {
                continue;
            }
            self.log_commit(format_args!(
                "Alert {} {} ({}) on {}",
                delta.key.alert_class,
                if delta.active { "raised" } else { "lowered" },
                delta.severity,
                delta.key.handle
            ));
            notices.push(AlertNotice {
                handle: delta.key.handle,
                active: delta.active,
                severity: delta.severity,
                alert_class: delta.key.alert_class,
                attribute: delta.key.attribute,
            });
        }
        notices
    }

    fn log_commit(&self, message: std::fmt::Arguments<'_>) {
        if self.debug {
            info!(plugin = %self.plugin_name, "{}", message);
        } else {
            debug!(plugin = %self.plugin_name, "{}", message);
        }
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        if let Some(key) = self.inner.get_mut().session {
            warn!(
                plugin = %self.plugin_name,
                scannable = %key.scannable_id,
                "Plugin instance dropped without teardown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::linux::LinuxPlugin;
    use crate::store::AlertStateRow;
    use crate::testing::Harness;
    use assert_matches::assert_matches;
    use std::collections::VecDeque;

    /// Sets one root attribute from a script, one value per scan
    struct StatusPlugin {
        attribute: &'static str,
        values: VecDeque<AttrValue>,
    }

    impl StatusPlugin {
        fn step(&mut self, ctx: &mut ScanContext<'_>) -> Result<()> {
            if let Some(value) = self.values.pop_front() {
                let root = ctx.root();
                ctx.set_attribute(root, self.attribute, value)?;
            }
            Ok(())
        }
    }

    impl Plugin for StatusPlugin {
        fn initial_scan(&mut self, ctx: &mut ScanContext<'_>) -> Result<()> {
            self.step(ctx)
        }

        fn update_scan(&mut self, ctx: &mut ScanContext<'_>) -> Result<()> {
            self.step(ctx)
        }
    }

    fn scripted<V>(h: &Harness, address: &str, attribute: &'static str, values: &[V]) -> PluginInstance
    where
        V: Into<AttrValue> + Clone,
    {
        let controller = h.controller("alert_plugin", address);
        PluginInstance::new(
            "alert_plugin",
            Box::new(StatusPlugin {
                attribute,
                values: values.iter().cloned().map(Into::into).collect(),
            }),
            controller,
            h.manager.clone(),
            h.manager.registry().clone(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn active_alerts(h: &Harness) -> Vec<AlertStateRow> {
        h.manager
            .store()
            .read(|t| t.alert_states.values().filter(|a| a.active).cloned().collect())
    }

    #[tokio::test]
    async fn test_alert_conditions_commit_changes_only() {
        let h = Harness::new();
        let instance = scripted(&h, "ctrl-r", "status", &["OK", "FAILED", "FAILED", "BADLY_FAILED", "OK"]);

        instance.do_initial_scan().unwrap();
        assert!(instance.session().is_some());
        assert!(active_alerts(&h).is_empty());

        instance.do_periodic_update().unwrap();
        let active = active_alerts(&h);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].alert_class, "Controller_status");
        assert_eq!(active[0].severity, Severity::Warning);

        instance.do_periodic_update().unwrap();
        assert_eq!(h.manager.metrics().alerts_raised, 1);

        // Warning is lowered before Error is raised, so the Error survives
        instance.do_periodic_update().unwrap();
        let active = active_alerts(&h);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, Severity::Error);

        instance.do_periodic_update().unwrap();
        assert!(active_alerts(&h).is_empty());

        instance.do_teardown();
        assert!(instance.session().is_none());
    }

    #[tokio::test]
    async fn test_bound_alert_steps_down_severity() {
        let h = Harness::new();
        let instance = scripted(&h, "ctrl-t", "temperature", &[40i64, 100, 90, 40]);
        instance.do_initial_scan().unwrap();
        assert!(active_alerts(&h).is_empty());

        instance.do_periodic_update().unwrap();
        let active = active_alerts(&h);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].alert_class, "Controller_temperature_high");
        assert_eq!(active[0].severity, Severity::Error);

        // Below the error bound but above the warning bound
        instance.do_periodic_update().unwrap();
        let active = active_alerts(&h);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].alert_class, "Controller_temperature_high");
        assert_eq!(active[0].severity, Severity::Warning);

        instance.do_periodic_update().unwrap();
        assert!(active_alerts(&h).is_empty());
        assert_eq!(h.manager.metrics().alerts_raised, 2);
        instance.do_teardown();
    }

    #[tokio::test]
    async fn test_one_value_many_alert_classes() {
        let h = Harness::new();
        let instance = scripted(&h, "ctrl-m", "multi_status", &["FAIL1"]);
        instance.do_initial_scan().unwrap();

        let mut classes: Vec<(String, Severity)> = active_alerts(&h)
            .into_iter()
            .map(|a| (a.alert_class, a.severity))
            .collect();
        classes.sort();
        assert_eq!(
            classes,
            vec![
                ("Controller_multi_status_failed_1".to_string(), Severity::Error),
                ("Controller_multi_status_failed_2".to_string(), Severity::Warning),
            ]
        );
        instance.do_teardown();
    }

    #[tokio::test]
    async fn test_update_before_initial_scan_fails() {
        let h = Harness::new();
        let instance = scripted::<&str>(&h, "ctrl-u", "status", &[]);
        assert_matches!(instance.do_periodic_update(), Err(Error::Internal(_)));

        instance.do_initial_scan().unwrap();
        assert_matches!(instance.do_initial_scan(), Err(Error::Internal(_)));
        instance.do_teardown();
    }

    fn linux_instance(h: &Harness, host_id: i64) -> PluginInstance {
        PluginInstance::new(
            "linux",
            LinuxPlugin::boxed(),
            h.host(host_id),
            h.manager.clone(),
            h.manager.registry().clone(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_agent_session_reconciles_inventory() {
        let h = Harness::new();
        let instance = linux_instance(&h, 1);

        instance
            .do_agent_session_start(&serde_json::json!({
                "devices": [{"serial": "S1", "size": 4096, "partitions": [{"number": 1, "size": 1024}]}],
                "nodes": [
                    {"path": "/dev/sda", "serial": "S1"},
                    {"path": "/dev/sda1", "serial": "S1", "partition": 1}
                ]
            }))
            .unwrap();
        assert!(h.find("linux", "Partition", "number", 1i64).is_some());
        let mut labels: Vec<String> = h.volumes().into_iter().map(|v| v.label).collect();
        labels.sort();
        assert_eq!(labels, vec!["Partition 1".to_string(), "S1".to_string()]);

        // The partition node goes away; its volume follows
        instance
            .do_agent_session_continue(&serde_json::json!({
                "devices": [{"serial": "S1", "size": 4096}],
                "nodes": [{"path": "/dev/sda", "serial": "S1"}]
            }))
            .unwrap();
        assert!(h.find("linux", "Partition", "number", 1i64).is_none());
        assert_eq!(h.volumes().len(), 1);
        assert_eq!(h.volume_nodes().len(), 1);

        instance
            .do_agent_session_continue(&serde_json::json!({"devices": [], "nodes": []}))
            .unwrap();
        assert!(h.find("linux", "ScsiDevice", "serial", "S1").is_none());
        assert!(h.volumes().is_empty());
        instance.do_teardown();
    }

    #[tokio::test]
    async fn test_bad_payload_is_callback_error() {
        let h = Harness::new();
        let instance = linux_instance(&h, 2);
        assert_matches!(
            instance.do_agent_session_start(&serde_json::json!({"devices": 3})),
            Err(Error::PluginCallback { plugin, .. }) if plugin == "linux"
        );
        assert!(instance.session().is_none());
    }
}
