//! Linux block device plugin
//!
//! Agent-driven: the host agent sends its full block device inventory on
//! every message and the plugin reconciles the reported resources with it.

use crate::attrs;
use crate::error::Result;
use crate::metamodel::{AttrMap, AttributeSpec, ClassBuilder, LocalHandle};
use crate::plugin::{Plugin, PluginModule, ScanContext};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

pub const MODULE: &str = "linux";

// =============================================================================
// Agent Payload
// =============================================================================

/// Block device inventory of one host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockDeviceReport {
    #[serde(default)]
    pub devices: Vec<DeviceReport>,
    #[serde(default)]
    pub nodes: Vec<NodeReport>,
}

/// A SCSI disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReport {
    /// SCSI serial, identifies the disk across hosts
    pub serial: String,
    /// Capacity in bytes
    pub size: i64,
    #[serde(default)]
    pub filesystem_type: Option<String>,
    #[serde(default)]
    pub partitions: Vec<PartitionReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionReport {
    pub number: i64,
    pub size: i64,
    #[serde(default)]
    pub filesystem_type: Option<String>,
}

/// A device node on the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub path: String,
    /// Serial of the disk behind the node
    pub serial: String,
    /// Partition number when the node exposes a partition
    #[serde(default)]
    pub partition: Option<i64>,
    /// Path of a node this one is stacked on
    #[serde(default)]
    pub parent: Option<String>,
}

// =============================================================================
// Module
// =============================================================================

fn serial_label(attrs: &AttrMap) -> String {
    attrs
        .get("serial")
        .map(ToString::to_string)
        .unwrap_or_default()
}

fn partition_label(attrs: &AttrMap) -> String {
    match attrs.get("number") {
        Some(number) => format!("Partition {}", number),
        None => "Partition".to_string(),
    }
}

pub fn module() -> PluginModule {
    PluginModule::new(MODULE)
        .with_plugin(LinuxPlugin::boxed)
        .with_class(
            ClassBuilder::new("ScsiDevice")
                .extends("LogicalDrive")
                .with_label("SCSI device")
                .global_id(&["serial"])
                .attribute(AttributeSpec::string("serial"))
                .label_with(serial_label),
        )
        .with_class(
            ClassBuilder::new("LinuxDeviceNode")
                .extends("DeviceNode")
                .with_label("Device node")
                .scoped_id(&["path"]),
        )
        .with_class(
            ClassBuilder::new("Partition")
                .extends("LogicalDriveSlice")
                .global_id(&["container", "number"])
                .attribute(AttributeSpec::reference("container"))
                .attribute(AttributeSpec::integer("number"))
                .label_with(partition_label),
        )
}

/// Reconciles reported block devices with agent inventories
#[derive(Debug, Default)]
pub struct LinuxPlugin {
    known: BTreeSet<LocalHandle>,
}

impl LinuxPlugin {
    pub fn boxed() -> Box<dyn Plugin> {
        Box::new(Self::default())
    }

    fn report(&mut self, ctx: &mut ScanContext<'_>, host_id: i64, data: &serde_json::Value) -> Result<()> {
        let report: BlockDeviceReport = serde_json::from_value(data.clone())?;
        let mut seen = BTreeSet::new();
        let mut drives: HashMap<(String, Option<i64>), LocalHandle> = HashMap::new();

        for device in &report.devices {
            let (disk, _) = ctx.update_or_create(
                "ScsiDevice",
                &[],
                attrs! {
                    "serial" => device.serial.as_str(),
                    "size" => device.size,
                    "filesystem_type" => device.filesystem_type.clone(),
                },
            )?;
            seen.insert(disk);
            drives.insert((device.serial.clone(), None), disk);

            for partition in &device.partitions {
                let (part, _) = ctx.update_or_create(
                    "Partition",
                    &[disk],
                    attrs! {
                        "container" => disk,
                        "number" => partition.number,
                        "size" => partition.size,
                        "filesystem_type" => partition.filesystem_type.clone(),
                    },
                )?;
                seen.insert(part);
                drives.insert((device.serial.clone(), Some(partition.number)), part);
            }
        }

        let mut nodes: HashMap<&str, LocalHandle> = HashMap::new();
        for node in &report.nodes {
            let Some(drive) = drives.get(&(node.serial.clone(), node.partition)).copied() else {
                warn!(path = %node.path, serial = %node.serial, "Device node for unreported disk");
                continue;
            };
            let parent = node
                .parent
                .as_deref()
                .and_then(|p| nodes.get(p))
                .copied()
                .unwrap_or(drive);
            let (handle, _) = ctx.update_or_create(
                "LinuxDeviceNode",
                &[parent],
                attrs! {
                    "host_id" => host_id,
                    "path" => node.path.as_str(),
                    "logical_drive" => drive,
                },
            )?;
            seen.insert(handle);
            nodes.insert(node.path.as_str(), handle);
        }

        for gone in self.known.difference(&seen) {
            if ctx.get(*gone).is_some() {
                ctx.remove(*gone)?;
            }
        }
        debug!(
            host_id,
            devices = report.devices.len(),
            nodes = report.nodes.len(),
            "Reconciled block devices"
        );
        self.known = seen;
        Ok(())
    }
}

impl Plugin for LinuxPlugin {
    fn initial_scan(&mut self, _ctx: &mut ScanContext<'_>) -> Result<()> {
        Ok(())
    }

    fn agent_session_start(
        &mut self,
        ctx: &mut ScanContext<'_>,
        host_id: i64,
        data: &serde_json::Value,
    ) -> Result<()> {
        self.known.clear();
        self.report(ctx, host_id, data)
    }

    fn agent_session_continue(
        &mut self,
        ctx: &mut ScanContext<'_>,
        host_id: i64,
        data: &serde_json::Value,
    ) -> Result<()> {
        self.report(ctx, host_id, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_defaults() {
        let report: BlockDeviceReport = serde_json::from_value(serde_json::json!({
            "devices": [{"serial": "S1", "size": 4096}],
            "nodes": [{"path": "/dev/sda", "serial": "S1"}]
        }))
        .unwrap();
        assert!(report.devices[0].partitions.is_empty());
        assert_eq!(report.nodes[0].partition, None);
        assert!(serde_json::from_value::<BlockDeviceReport>(serde_json::json!({"devices": 3})).is_err());
    }

    #[test]
    fn test_labels() {
        assert_eq!(serial_label(&attrs! { "serial" => "S1" }), "S1");
        assert_eq!(partition_label(&attrs! { "number" => 2 }), "Partition 2");
    }
}
