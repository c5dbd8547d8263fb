//! Built-in plugin modules

pub mod linux;
pub mod linux_network;

use crate::plugin::PluginModule;

/// Every plugin module compiled into the daemon
pub fn catalog() -> Vec<PluginModule> {
    vec![linux::module(), linux_network::module()]
}
