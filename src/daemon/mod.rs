//! Daemons
//!
//! Long-running services around the resource manager:
//!
//! - [`ScanDaemon`]: one session task per scannable record of scan-driven plugins
//! - [`AgentDaemon`]: plugin sessions driven by messages from host agents
//! - control RPC: administrative endpoints, health and metrics

mod agent;
mod control;
mod scan;

pub use agent::{AgentDaemon, AgentMessage};
pub use control::{
    control_router, serve_control, ExceptionBody, ExceptionResponse, ModifyResourceRequest,
    RemoveResourceRequest,
};
pub use scan::ScanDaemon;
