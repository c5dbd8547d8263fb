//! Linux network plugin
//!
//! Agent-driven report of host network interfaces and the LNet NIDs
//! bound to them.

use crate::attrs;
use crate::error::Result;
use crate::metamodel::{ClassBuilder, LocalHandle};
use crate::plugin::{Plugin, PluginModule, ScanContext};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

pub const MODULE: &str = "linux_network";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkReport {
    #[serde(default)]
    pub interfaces: Vec<InterfaceReport>,
    #[serde(default)]
    pub lnet: Option<LnetReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceReport {
    pub name: String,
    #[serde(default)]
    pub inet4_address: Option<String>,
    #[serde(default)]
    pub inet4_prefix: Option<i64>,
    #[serde(default, rename = "type")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub up: bool,
}

/// LNet state and configured NIDs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnetReport {
    pub state: String,
    #[serde(default)]
    pub nids: Vec<NidReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NidReport {
    /// Name of the interface the NID is bound to
    pub interface: String,
    #[serde(default)]
    pub lnd_network: Option<i64>,
    #[serde(default)]
    pub lnd_type: Option<String>,
}

pub fn module() -> PluginModule {
    PluginModule::new(MODULE)
        .with_plugin(LinuxNetworkPlugin::boxed)
        .with_class(
            ClassBuilder::new("HostNetworkInterface")
                .extends("NetworkInterface")
                .with_label("Network interface")
                .scoped_id(&["name"]),
        )
        .with_class(
            ClassBuilder::new("HostLnetInterface")
                .extends("LnetInterface")
                .with_label("LNet interface")
                .scoped_id(&["name"]),
        )
        .with_class(
            ClassBuilder::new("HostLnetModules")
                .extends("LnetModules")
                .with_label("LNet modules")
                .scoped_id(&["host_id"]),
        )
}

#[derive(Debug, Default)]
pub struct LinuxNetworkPlugin {
    known: BTreeSet<LocalHandle>,
}

impl LinuxNetworkPlugin {
    pub fn boxed() -> Box<dyn Plugin> {
        Box::new(Self::default())
    }

    fn report(&mut self, ctx: &mut ScanContext<'_>, host_id: i64, data: &serde_json::Value) -> Result<()> {
        let report: NetworkReport = serde_json::from_value(data.clone())?;
        let mut seen = BTreeSet::new();
        let mut interfaces: HashMap<&str, LocalHandle> = HashMap::new();

        for interface in &report.interfaces {
            let (handle, _) = ctx.update_or_create(
                "HostNetworkInterface",
                &[],
                attrs! {
                    "name" => interface.name.as_str(),
                    "host_id" => host_id,
                    "inet4_address" => interface.inet4_address.clone(),
                    "inet4_prefix" => interface.inet4_prefix,
                    "type" => interface.type_name.clone(),
                    "up" => interface.up,
                },
            )?;
            seen.insert(handle);
            interfaces.insert(interface.name.as_str(), handle);
        }

        if let Some(lnet) = &report.lnet {
            let (modules, _) = ctx.update_or_create(
                "HostLnetModules",
                &[],
                attrs! { "host_id" => host_id, "state" => lnet.state.as_str() },
            )?;
            seen.insert(modules);

            for nid in &lnet.nids {
                let Some(interface) = interfaces.get(nid.interface.as_str()).copied() else {
                    warn!(interface = %nid.interface, "NID on unreported interface");
                    continue;
                };
                let (handle, _) = ctx.update_or_create(
                    "HostLnetInterface",
                    &[interface],
                    attrs! {
                        "name" => nid.interface.as_str(),
                        "lnd_network" => nid.lnd_network,
                        "lnd_type" => nid.lnd_type.clone(),
                    },
                )?;
                seen.insert(handle);
            }
        }

        for gone in self.known.difference(&seen) {
            if ctx.get(*gone).is_some() {
                ctx.remove(*gone)?;
            }
        }
        debug!(host_id, interfaces = report.interfaces.len(), "Reconciled network interfaces");
        self.known = seen;
        Ok(())
    }
}

impl Plugin for LinuxNetworkPlugin {
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
