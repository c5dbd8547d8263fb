//! Plugin Framework
//!
//! Plugin modules, the class registry built from them, and the runtime
//! binding a plugin instance to one scannable record.

mod api;
mod index;
mod manager;
mod registry;
mod runtime;

pub use api::{Plugin, PluginFactory, PluginModule, PLUGIN_API_VERSION};
pub use index::{LocalResource, ReportedResource, ResourceIndex};
pub use manager::{builtin_module, PluginManager};
pub use registry::ClassRegistry;
pub use runtime::{PluginInstance, ScanContext};
