//! Scan Daemon
//!
//! Runs one session task per scannable record of every loaded plugin. A
//! task drives initial and periodic scans on the blocking pool and restarts
//! the session with exponential backoff when it fails.

use crate::config::DaemonConfig;
use crate::error::{Error, ErrorAction, Result};
use crate::manager::ResourceManager;
use crate::metamodel::AttrMap;
use crate::plugin::{PluginInstance, PluginManager};
use crate::store::RecordId;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Run a blocking plugin call off the async workers
pub(crate) async fn blocking<R, F>(f: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("plugin worker failed: {}", e)))?
}

struct ScanSession {
    plugin: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the session tasks of scan-driven plugins
pub struct ScanDaemon {
    plugins: Arc<PluginManager>,
    manager: Arc<ResourceManager>,
    config: DaemonConfig,
    sessions: Mutex<HashMap<RecordId, ScanSession>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ScanDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanDaemon")
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl ScanDaemon {
    pub fn new(plugins: Arc<PluginManager>, manager: Arc<ResourceManager>, config: DaemonConfig) -> Arc<Self> {
        Arc::new(Self {
            plugins,
            manager,
            config,
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Poll for new scannable records until shut down, then stop every session
    pub async fn run(self: Arc<Self>) {
        info!(
            plugins = ?self.plugins.loaded_plugin_names(),
            poll_secs = self.config.new_session_poll_secs,
            "Scan daemon started"
        );
        loop {
            self.start_new_sessions();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.new_session_poll()) => {}
            }
        }
        self.stop_all().await;
        info!("Scan daemon stopped");
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn has_session(&self, scannable: RecordId) -> bool {
        self.sessions.lock().contains_key(&scannable)
    }

    /// Start a session task for every scannable record without one
    pub fn start_new_sessions(self: &Arc<Self>) {
        for plugin in self.plugins.loaded_plugin_names() {
            let scannables = match self.plugins.get_scannable_resource_ids(&plugin) {
                Ok(ids) => ids,
                Err(e) => {
                    error!(%plugin, error = %e, "Failed to list scannable resources");
                    continue;
                }
            };
            for scannable in scannables {
                if self.has_session(scannable) {
                    continue;
                }
                self.start_session(&plugin, scannable);
            }
        }
    }

    fn start_session(self: &Arc<Self>, plugin: &str, scannable: RecordId) {
        let cancel = self.shutdown.child_token();
        let daemon = self.clone();
        let task = tokio::spawn({
            let plugin = plugin.to_string();
            let cancel = cancel.clone();
            async move { daemon.session_loop(plugin, scannable, cancel).await }
        });
        info!(%plugin, %scannable, "Started scan session");
        self.sessions.lock().insert(
            scannable,
            ScanSession {
                plugin: plugin.to_string(),
                cancel,
                task,
            },
        );
    }

    /// Stop the session of a scannable, waiting for its teardown
    pub async fn stop_session(&self, scannable: RecordId) {
        let Some(session) = self.sessions.lock().remove(&scannable) else {
            return;
        };
        session.cancel.cancel();
        if let Err(e) = session.task.await {
            error!(plugin = %session.plugin, %scannable, error = %e, "Scan session task failed");
        }
        info!(plugin = %session.plugin, %scannable, "Stopped scan session");
    }

    async fn stop_all(&self) {
        let scannables: Vec<RecordId> = self.sessions.lock().keys().copied().collect();
        for scannable in scannables {
            self.stop_session(scannable).await;
        }
    }

    /// Stop any session of the record, then remove it and its dependents
    pub async fn remove_resource(&self, record: RecordId) -> Result<()> {
        info!(%record, "Removing resource");
        self.stop_session(record).await;
        self.manager.global_remove_resource(record)
    }

    /// Stop any session of the record, then update its attributes. The
    /// next poll starts a fresh session.
    pub async fn modify_resource(&self, record: RecordId, attrs: &AttrMap) -> Result<()> {
        info!(%record, attributes = attrs.len(), "Modifying resource");
        self.stop_session(record).await;
        self.manager.modify_resource(record, attrs)
    }

    // =========================================================================
    // Session loop
    // =========================================================================

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.retry_delay_min())
            .with_max_interval(self.config.retry_delay_max())
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    async fn session_loop(self: Arc<Self>, plugin: String, scannable: RecordId, cancel: CancellationToken) {
        let mut backoff = self.new_backoff();
        loop {
            let started = Instant::now();
            let outcome = self.run_session(&plugin, scannable, &cancel).await;
            if cancel.is_cancelled() {
                break;
            }
            let err = match outcome {
                Ok(()) => break,
                Err(e) => e,
            };
            if let Err(e) = self.manager.notify_offline(scannable, true) {
                warn!(%scannable, error = %e, "Failed to raise offline alert");
            }

            // A long clean run starts the backoff over
            if started.elapsed() > self.config.retry_delay_max() {
                backoff.reset();
            }
            let delay = match err.action() {
                ErrorAction::NoRequeue => {
                    error!(%plugin, %scannable, error = %err, "Scan session failed permanently");
                    break;
                }
                ErrorAction::RequeueAfter(delay) => delay,
                ErrorAction::RequeueWithBackoff => backoff
                    .next_backoff()
                    .unwrap_or_else(|| self.config.retry_delay_max()),
            };
            error!(
                %plugin,
                %scannable,
                error = %err,
                retry_secs = delay.as_secs(),
                "Scan session failed, restarting"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(%plugin, %scannable, "Scan session loop finished");
    }

    /// One session: initial scan, then periodic updates until cancelled
    async fn run_session(&self, plugin: &str, scannable: RecordId, cancel: &CancellationToken) -> Result<()> {
        let instance = Arc::new(
            PluginInstance::new(
                plugin,
                self.plugins.create_plugin(plugin)?,
                scannable,
                self.manager.clone(),
                self.plugins.registry(),
                self.config.update_period(),
            )?
            .with_debug(self.config.is_debug_plugin(plugin)),
        );

        let result = self.drive(&instance, scannable, cancel).await;
        let teardown = instance.clone();
        blocking(move || {
            teardown.do_teardown();
            Ok(())
        })
        .await?;
        result
    }

    async fn drive(&self, instance: &Arc<PluginInstance>, scannable: RecordId, cancel: &CancellationToken) -> Result<()> {
        let scan = instance.clone();
        blocking(move || scan.do_initial_scan()).await?;

        let mut online = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(instance.update_period()) => {}
            }
            let update = instance.clone();
            blocking(move || update.do_periodic_update()).await?;
            if !online {
                self.manager.notify_offline(scannable, false)?;
                online = true;
            }
        }
    }
}
