//! Builtin resource classes
//!
//! Abstract base classes that plugins derive from. The resource manager
//! keys volume derivation, NID projection and host creation off these.

use super::attributes::AttributeSpec;
use super::class::ClassBuilder;

pub const BUILTIN_MODULE: &str = "builtin";

pub const STORAGE_RESOURCE: &str = "builtin.StorageResource";
pub const SCANNABLE_RESOURCE: &str = "builtin.ScannableResource";
pub const HOSTSIDE_RESOURCE: &str = "builtin.HostsideResource";
pub const LOGICAL_DRIVE: &str = "builtin.LogicalDrive";
pub const LOGICAL_DRIVE_SLICE: &str = "builtin.LogicalDriveSlice";
pub const LOGICAL_DRIVE_OCCUPIER: &str = "builtin.LogicalDriveOccupier";
pub const DEVICE_NODE: &str = "builtin.DeviceNode";
pub const STORAGE_POOL: &str = "builtin.StoragePool";
pub const CONTROLLER: &str = "builtin.Controller";
pub const VIRTUAL_MACHINE: &str = "builtin.VirtualMachine";
pub const NETWORK_INTERFACE: &str = "builtin.NetworkInterface";
pub const LNET_INTERFACE: &str = "builtin.LnetInterface";
pub const LNET_MODULES: &str = "builtin.LnetModules";
pub const PLUGIN_AGENT_RESOURCES: &str = "builtin.PluginAgentResources";

/// Builtin classes, bases before subclasses
pub fn classes() -> Vec<ClassBuilder> {
    vec![
        ClassBuilder::new("StorageResource").abstract_class(),
        ClassBuilder::new("ScannableResource")
            .extends("StorageResource")
            .abstract_class(),
        ClassBuilder::new("HostsideResource")
            .extends("StorageResource")
            .abstract_class(),
        ClassBuilder::new("LogicalDrive")
            .extends("StorageResource")
            .abstract_class()
            .attribute(AttributeSpec::bytes("size"))
            .attribute(AttributeSpec::string("filesystem_type").optional())
            .attribute(AttributeSpec::boolean("usable_for_lustre").default_value(true)),
        ClassBuilder::new("LogicalDriveSlice")
            .extends("LogicalDrive")
            .abstract_class(),
        ClassBuilder::new("LogicalDriveOccupier")
            .extends("StorageResource")
            .abstract_class(),
        ClassBuilder::new("DeviceNode")
            .extends("StorageResource")
            .abstract_class()
            .attribute(AttributeSpec::integer("host_id"))
            .attribute(AttributeSpec::posix_path("path"))
            .attribute(AttributeSpec::reference("logical_drive").optional()),
        ClassBuilder::new("StoragePool")
            .extends("StorageResource")
            .abstract_class(),
        ClassBuilder::new("Controller")
            .extends("ScannableResource")
            .abstract_class()
            .attribute(AttributeSpec::hostname("address")),
        ClassBuilder::new("VirtualMachine")
            .extends("StorageResource")
            .abstract_class()
            .attribute(AttributeSpec::hostname("address"))
            .attribute(AttributeSpec::integer("host_id").optional()),
        ClassBuilder::new("NetworkInterface")
            .extends("StorageResource")
            .abstract_class()
            .attribute(AttributeSpec::string("name"))
            .attribute(AttributeSpec::string("inet4_address").optional())
            .attribute(AttributeSpec::bounded_integer("inet4_prefix", Some(0), Some(32)).optional())
            .attribute(AttributeSpec::string("type").optional())
            .attribute(AttributeSpec::boolean("up").default_value(false))
            .attribute(AttributeSpec::integer("host_id")),
        ClassBuilder::new("LnetInterface")
            .extends("StorageResource")
            .abstract_class()
            .attribute(AttributeSpec::string("name"))
            .attribute(AttributeSpec::integer("lnd_network").optional())
            .attribute(AttributeSpec::string("lnd_type").optional()),
        ClassBuilder::new("LnetModules")
            .extends("StorageResource")
            .abstract_class()
            .attribute(AttributeSpec::string("state"))
            .attribute(AttributeSpec::integer("host_id")),
        ClassBuilder::new("PluginAgentResources")
            .extends("HostsideResource")
            .with_label("Agent resources")
            .global_id(&["host_id", "plugin_name"])
            .attribute(AttributeSpec::integer("host_id"))
            .attribute(AttributeSpec::string("plugin_name")),
    ]
}
