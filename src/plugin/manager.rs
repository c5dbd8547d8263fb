//! Plugin Manager
//!
//! Loads the configured plugin modules at startup, compiles their resource
//! classes into the [`ClassRegistry`] and resolves relations. A module that
//! fails any check is recorded as errored and skipped.

use super::api::{Plugin, PluginModule};
use super::registry::ClassRegistry;
use crate::error::{Error, Result};
use crate::metamodel::{builtin, ResourceClass};
use crate::store::{ClassId, RecordId, Store};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Loaded plugin modules and the class registry built from them
pub struct PluginManager {
    registry: Arc<ClassRegistry>,
    modules: IndexMap<String, PluginModule>,
    errored: BTreeMap<String, String>,
    store: Arc<Store>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("loaded", &self.loaded_plugin_names())
            .field("errored", &self.errored)
            .finish()
    }
}

/// The builtin module holding the abstract base classes
pub fn builtin_module() -> PluginModule {
    builtin::classes()
        .into_iter()
        .fold(PluginModule::new(builtin::BUILTIN_MODULE).internal(), |m, c| {
            m.with_class(c)
        })
}

impl PluginManager {
    /// Load every installed module from the catalog.
    ///
    /// Only store failures are fatal; plugin problems land in
    /// [`PluginManager::errored_plugins`].
    pub fn load_plugins(
        catalog: &[PluginModule],
        installed: &[String],
        store: Arc<Store>,
    ) -> Result<Self> {
        let mut registry = ClassRegistry::new();
        let mut modules = IndexMap::new();
        let mut errored = BTreeMap::new();

        let builtin = builtin_module();
        compile_module(&builtin, &mut registry, &store)?;
        modules.insert(builtin.name.clone(), builtin);

        for name in installed {
            if modules.contains_key(name) {
                warn!(plugin = %name, "Plugin listed twice in installed_plugins");
                continue;
            }
            let Some(module) = catalog.iter().find(|m| &m.name == name) else {
                let err = Error::PluginLoad {
                    module: name.clone(),
                    reason: format!("No module named {}", name),
                };
                error!(plugin = %name, error = %err, "Failed to import plugin");
                errored.insert(name.clone(), err.to_string());
                continue;
            };

            if let Err(reason) = module.check() {
                let err = Error::PluginLoad {
                    module: name.clone(),
                    reason,
                };
                error!(plugin = %name, error = %err, "Invalid plugin module");
                errored.insert(name.clone(), err.to_string());
                continue;
            }

            let mut staged = registry.clone();
            match compile_module(module, &mut staged, &store) {
                Ok(()) => {
                    registry = staged;
                    modules.insert(name.clone(), module.clone());
                }
                Err(e) if is_plugin_problem(&e) => {
                    error!(plugin = %name, error = %e, "Failed to load plugin classes");
                    errored.insert(name.clone(), e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        let loaded: Vec<String> = modules.keys().cloned().collect();
        for name in loaded {
            if let Err(e) = registry.check_relations(&name) {
                error!(plugin = %name, error = %e, "Failed to resolve plugin relations");
                registry.remove_module(&name);
                modules.shift_remove(&name);
                errored.insert(name, e.to_string());
            }
        }
        registry.resolve_subscriptions();

        store.transaction(|t| {
            for module in modules.values() {
                t.upsert_plugin(&module.name, module.internal);
            }
            Ok(())
        })?;

        info!(
            loaded = ?modules.keys().collect::<Vec<_>>(),
            errored = errored.len(),
            "Plugins loaded"
        );

        Ok(Self {
            registry: Arc::new(registry),
            modules,
            errored,
            store,
        })
    }

    /// Run every load check for one module against a throwaway registry.
    ///
    /// Returns human readable errors; an empty list means the module is valid.
    pub fn validate_plugin(catalog: &[PluginModule], name: &str) -> Vec<String> {
        let store = Arc::new(Store::in_memory());
        match Self::load_plugins(catalog, &[name.to_string()], store) {
            Ok(manager) => manager.errored.values().cloned().collect(),
            Err(e) => vec![e.to_string()],
        }
    }

    pub fn registry(&self) -> Arc<ClassRegistry> {
        self.registry.clone()
    }

    /// Look up a class by plugin and class name
    pub fn get_plugin_resource_class(
        &self,
        plugin: &str,
        class_name: &str,
    ) -> Result<(Arc<ResourceClass>, ClassId)> {
        self.registry
            .lookup(plugin, class_name)
            .map(|c| (c.clone(), c.id))
            .ok_or_else(|| Error::PluginNotFound(format!("{}.{}", plugin, class_name)))
    }

    pub fn get_resource_class_by_id(&self, id: ClassId) -> Result<Arc<ResourceClass>> {
        self.registry
            .get(id)
            .cloned()
            .ok_or_else(|| Error::PluginNotFound(format!("resource class {}", id)))
    }

    pub fn get_resource_class_id(&self, plugin: &str, class_name: &str) -> Result<ClassId> {
        self.get_plugin_resource_class(plugin, class_name)
            .map(|(_, id)| id)
    }

    /// Concrete scannable classes of every loaded plugin
    pub fn get_scannable_resource_classes(&self) -> Vec<Arc<ResourceClass>> {
        let mut classes: Vec<_> = self
            .registry
            .classes()
            .filter(|c| c.is_scannable() && !c.abstract_class)
            .cloned()
            .collect();
        classes.sort_by_key(|c| c.id);
        classes
    }

    /// Records of a plugin's scannable classes that have no parents
    pub fn get_scannable_resource_ids(&self, plugin: &str) -> Result<Vec<RecordId>> {
        if !self.modules.contains_key(plugin) {
            return Err(Error::PluginNotFound(plugin.to_string()));
        }
        let class_ids: Vec<ClassId> = self
            .registry
            .module_classes(plugin)
            .filter(|c| c.is_scannable() && !c.abstract_class)
            .map(|c| c.id)
            .collect();
        Ok(self.store.read(|t| {
            t.records
                .values()
                .filter(|r| class_ids.contains(&r.class_id) && r.parents.is_empty())
                .map(|r| r.id)
                .collect()
        }))
    }

    pub fn get_plugin_module(&self, name: &str) -> Result<&PluginModule> {
        self.modules
            .get(name)
            .ok_or_else(|| Error::PluginNotFound(name.to_string()))
    }

    /// Instantiate the plugin of a loaded module
    pub fn create_plugin(&self, name: &str) -> Result<Box<dyn Plugin>> {
        let module = self.get_plugin_module(name)?;
        module
            .plugins
            .first()
            .map(|factory| factory())
            .ok_or_else(|| Error::PluginNotFound(name.to_string()))
    }

    /// Names of loaded, non-internal plugins
    pub fn loaded_plugin_names(&self) -> Vec<String> {
        self.modules
            .values()
            .filter(|m| !m.internal)
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn errored_plugins(&self) -> &BTreeMap<String, String> {
        &self.errored
    }
}

fn is_plugin_problem(err: &Error) -> bool {
    matches!(
        err,
        Error::PluginLoad { .. } | Error::ResourceProgramming { .. }
    )
}

/// Compile a module's classes into the registry, bases before subclasses
fn compile_module(module: &PluginModule, registry: &mut ClassRegistry, store: &Store) -> Result<()> {
    let names: Vec<(String, String)> = module
        .classes
        .iter()
        .map(|c| (module.name.clone(), c.name().to_string()))
        .collect();
    let ids: Vec<ClassId> = store.transaction(|t| {
        Ok(names
            .iter()
            .map(|(m, c)| t.upsert_resource_class(m, c))
            .collect())
    })?;

    let mut seen = std::collections::HashSet::new();
    for (builder, id) in module.classes.iter().zip(ids) {
        if !seen.insert(builder.name()) {
            return Err(Error::ResourceProgramming {
                class_name: builder.name().to_string(),
                message: "declared twice".into(),
            });
        }
        let base = match builder.base() {
            Some(base_name) => Some(
                registry
                    .resolve(&module.name, base_name)
                    .cloned()
                    .ok_or_else(|| Error::ResourceProgramming {
                        class_name: builder.name().to_string(),
                        message: format!("unknown base class '{}'", base_name),
                    })?,
            ),
            None => None,
        };
        let class = builder.compile(id, &module.name, base.as_deref())?;
        registry.insert(class);
    }
    Ok(())
}
