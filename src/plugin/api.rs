//! Plugin API
//!
//! Plugin modules are compiled in and described by a [`PluginModule`]
//! descriptor. Each module carries exactly one plugin factory and the
//! resource classes it reports.

use super::runtime::ScanContext;
use crate::error::Result;
use crate::metamodel::ClassBuilder;

/// API version plugin modules must declare
pub const PLUGIN_API_VERSION: u32 = 1;

/// Callbacks implemented by a storage plugin
pub trait Plugin: Send {
    /// Report the complete current inventory of the scannable
    fn initial_scan(&mut self, ctx: &mut ScanContext<'_>) -> Result<()>;

    /// Incremental refresh, called every update period
    fn update_scan(&mut self, _ctx: &mut ScanContext<'_>) -> Result<()> {
        Ok(())
    }

    /// First message of an agent session
    fn agent_session_start(
        &mut self,
        _ctx: &mut ScanContext<'_>,
        _host_id: i64,
        _data: &serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }

    /// Subsequent messages of an agent session
    fn agent_session_continue(
        &mut self,
        _ctx: &mut ScanContext<'_>,
        _host_id: i64,
        _data: &serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once the session ends
    fn teardown(&mut self) {}
}

/// Constructor for a plugin instance
pub type PluginFactory = fn() -> Box<dyn Plugin>;

/// Descriptor of a compiled-in plugin module
#[derive(Debug, Clone)]
pub struct PluginModule {
    pub name: String,
    /// Declared API version; `None` when the module does not declare one
    pub version: Option<u32>,
    /// Internal modules are not offered to administrators
    pub internal: bool,
    pub plugins: Vec<PluginFactory>,
    pub classes: Vec<ClassBuilder>,
}

impl PluginModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(PLUGIN_API_VERSION),
            internal: false,
            plugins: Vec::new(),
            classes: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: Option<u32>) -> Self {
        self.version = version;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn with_plugin(mut self, factory: PluginFactory) -> Self {
        self.plugins.push(factory);
        self
    }

    pub fn with_class(mut self, class: ClassBuilder) -> Self {
        self.classes.push(class);
        self
    }

    /// Check the module shape: declared version and a single plugin
    pub fn check(&self) -> std::result::Result<(), String> {
        match self.version {
            None => return Err("no 'version' declared".into()),
            Some(v) if v != PLUGIN_API_VERSION => {
                return Err(format!(
                    "version {} does not match manager API version {}",
                    v, PLUGIN_API_VERSION
                ))
            }
            Some(_) => {}
        }
        match self.plugins.len() {
            0 => Err("no Plugin class found".into()),
            1 => Ok(()),
            n => Err(format!("{} Plugin classes found, expected one", n)),
        }
    }
}
