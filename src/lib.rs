//! Storage Resource Manager
//!
//! Keeps a persistent graph of storage resources (controllers, LUNs, disks,
//! device nodes, network interfaces) reported by plugins that scan storage
//! controllers or run on servers through host agents.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              Daemons                                 │
//! │  ┌───────────────┐   ┌────────────────┐   ┌───────────────────────┐  │
//! │  │  Scan daemon  │   │  Agent daemon  │   │      Control RPC      │  │
//! │  └───────┬───────┘   └───────┬────────┘   └───────────┬───────────┘  │
//! │          └───────────────────┼────────────────────────┘              │
//! │                   ┌──────────┴──────────┐                            │
//! │                   │  Plugin instances   │                            │
//! │                   │  (resource index)   │                            │
//! │                   └──────────┬──────────┘                            │
//! │                   ┌──────────┴──────────┐                            │
//! │                   │  Resource manager   │  volumes, alerts, events   │
//! │                   └──────────┬──────────┘                            │
//! │                   ┌──────────┴──────────┐                            │
//! │                   │        Store        │  tables, JSON snapshot     │
//! │                   └─────────────────────┘                            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`metamodel`]: Resource classes, attributes, identifiers, relations and alert conditions
//! - [`plugin`]: Plugin API, loading and the per-session runtime
//! - [`manager`]: The resource graph, sessions, volume derivation and alerts
//! - [`store`]: Transactional tables persisted as a snapshot
//! - [`daemon`]: Scan, agent and control services
//! - [`plugins`]: Built-in plugin modules
//! - [`jobs`]: Host bookkeeping for virtual machines
//! - [`config`]: Daemon configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod daemon;
pub mod error;
pub mod jobs;
pub mod manager;
pub mod metamodel;
pub mod plugin;
pub mod plugins;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::DaemonConfig;

pub use daemon::{AgentDaemon, AgentMessage, ScanDaemon};

pub use error::{Error, ErrorAction, Result};

pub use jobs::{JobScheduler, QueuedJobScheduler};

pub use manager::{ResourceEvent, ResourceManager, SessionKey};

pub use metamodel::{AttrMap, AttrValue, ClassBuilder, LocalHandle, ResourceClass, Severity};

pub use plugin::{Plugin, PluginInstance, PluginManager, PluginModule, ReportedResource, ScanContext};

pub use store::{RecordId, Store};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
