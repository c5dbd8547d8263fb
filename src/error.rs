//! Error types for the Storage Resource Manager
//!
//! Provides structured error types for every component: plugin loading,
//! the resource metamodel, plugin sessions, the resource manager and the
//! persistence adapter.

use crate::store::RecordId;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the resource manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Plugin Errors
    // =========================================================================
    #[error("Failed to load plugin {module}: {reason}")]
    PluginLoad { module: String, reason: String },

    #[error("Resource class '{class_name}': {message}")]
    ResourceProgramming { class_name: String, message: String },

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin {plugin} callback failed: {reason}")]
    PluginCallback { plugin: String, reason: String },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Resource not found: {class_name} {id}")]
    ResourceNotFound { class_name: String, id: String },

    #[error("Duplicate resource added to index: {class_name} {id}")]
    DuplicateResource { class_name: String, id: String },

    #[error("Unknown attribute {attribute} on {class_name}")]
    UnknownAttribute { class_name: String, attribute: String },

    #[error("Invalid value for {class_name}.{attribute}: {reason}")]
    InvalidAttribute {
        class_name: String,
        attribute: String,
        reason: String,
    },

    #[error("Storage resource record {record_id} not found")]
    RecordNotFound { record_id: RecordId },

    // =========================================================================
    // Session Errors
    // =========================================================================
    #[error("Session for scannable {scannable_id} is stale or closed")]
    SessionStale { scannable_id: RecordId },

    #[error("Parent {parent} of {child} not yet known in session {scannable_id}")]
    DependencyRace {
        scannable_id: RecordId,
        child: u64,
        parent: u64,
    },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Persistence error: {0}")]
    Persistence(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error inside a scan loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Restart the session with exponential backoff
    RequeueWithBackoff,
    /// Restart the session after a specific duration
    RequeueAfter(Duration),
    /// Don't restart, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // A replaced session will be restarted by its new owner
            Error::SessionStale { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Broken plugin code or configuration - don't retry automatically
            Error::PluginLoad { .. }
            | Error::ResourceProgramming { .. }
            | Error::PluginNotFound(_)
            | Error::Configuration(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Persistence(_) | Error::Io(_) | Error::SessionStale { .. }
        )
    }

    /// Name used for the exception class in control RPC payloads
    pub fn exception_name(&self) -> &'static str {
        match self {
            Error::Internal(_) => "InternalError",
            Error::Configuration(_) => "ConfigurationError",
            Error::PluginLoad { .. } => "PluginLoadError",
            Error::ResourceProgramming { .. } => "ResourceProgrammingError",
            Error::PluginNotFound(_) => "PluginNotFound",
            Error::PluginCallback { .. } => "PluginCallbackError",
            Error::ResourceNotFound { .. } => "ResourceNotFound",
            Error::DuplicateResource { .. } => "DuplicateResource",
            Error::UnknownAttribute { .. } => "UnknownAttribute",
            Error::InvalidAttribute { .. } => "ValueError",
            Error::RecordNotFound { .. } => "DoesNotExist",
            Error::SessionStale { .. } => "SessionStale",
            Error::DependencyRace { .. } => "DependencyRace",
            Error::Persistence(_) => "PersistenceError",
            Error::JsonParse(_) | Error::YamlParse(_) => "ParseError",
            Error::Io(_) => "IOError",
        }
    }
}

/// Result type alias for the resource manager
pub type Result<T> = std::result::Result<T, Error>;
