//! Agent Daemon
//!
//! Host agents push plugin payloads over a message queue. The first message
//! of an agent session (counter 1) starts a plugin instance bound to the
//! host's `PluginAgentResources` record; later messages continue it.

use super::scan::blocking;
use crate::attrs;
use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::manager::ResourceManager;
use crate::metamodel::builtin;
use crate::plugin::{PluginInstance, PluginManager};
use crate::store::RecordId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One message from a host agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub host_id: i64,
    /// Changes whenever the agent restarts
    pub session_id: String,
    /// Position of the message within the agent session, starting at 1
    pub counter: u64,
    /// Payload per plugin name
    #[serde(default)]
    pub updates: BTreeMap<String, serde_json::Value>,
}

struct AgentSession {
    session_id: String,
    instance: Arc<PluginInstance>,
}

/// Dispatches agent messages to per-host plugin instances
pub struct AgentDaemon {
    plugins: Arc<PluginManager>,
    manager: Arc<ResourceManager>,
    config: DaemonConfig,
    sessions: Mutex<HashMap<(i64, String), AgentSession>>,
    blacklist: Mutex<HashSet<i64>>,
}

impl std::fmt::Debug for AgentDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDaemon")
            .field("sessions", &self.sessions.lock().len())
            .field("blacklisted", &self.blacklist.lock().len())
            .finish()
    }
}

impl AgentDaemon {
    pub fn new(plugins: Arc<PluginManager>, manager: Arc<ResourceManager>, config: DaemonConfig) -> Arc<Self> {
        Arc::new(Self {
            plugins,
            manager,
            config,
            sessions: Mutex::new(HashMap::new()),
            blacklist: Mutex::new(HashSet::new()),
        })
    }

    /// Consume messages until the queue closes or shutdown is requested
    pub async fn run(self: Arc<Self>, mut messages: mpsc::Receiver<AgentMessage>, shutdown: CancellationToken) {
        info!("Agent daemon started");
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let daemon = self.clone();
            if let Err(e) = blocking(move || {
                daemon.on_message(message);
                Ok(())
            })
            .await
            {
                error!(error = %e, "Agent message handler failed");
            }
        }
        let daemon = self.clone();
        if let Err(e) = blocking(move || {
            daemon.teardown_all();
            Ok(())
        })
        .await
        {
            error!(error = %e, "Agent session teardown failed");
        }
        info!("Agent daemon stopped");
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn has_session(&self, host_id: i64, plugin: &str) -> bool {
        self.sessions.lock().contains_key(&(host_id, plugin.to_string()))
    }

    pub fn is_blacklisted(&self, host_id: i64) -> bool {
        self.blacklist.lock().contains(&host_id)
    }

    /// Accept messages from a host again after its removal
    pub fn unblacklist_host(&self, host_id: i64) {
        self.blacklist.lock().remove(&host_id);
    }

    /// Handle one message; failures are logged, never propagated
    pub fn on_message(&self, message: AgentMessage) {
        if self.is_blacklisted(message.host_id) {
            debug!(host_id = message.host_id, "Dropping message for host being removed");
            return;
        }
        for (plugin, data) in &message.updates {
            let result = if message.counter == 1 {
                self.start_session(&message, plugin, data)
            } else {
                self.continue_session(&message, plugin, data)
            };
            if let Err(e) = result {
                error!(
                    host_id = message.host_id,
                    %plugin,
                    counter = message.counter,
                    error = %e,
                    "Agent plugin callback failed, tearing down session"
                );
                self.teardown(message.host_id, plugin);
            }
        }
    }

    fn start_session(&self, message: &AgentMessage, plugin: &str, data: &serde_json::Value) -> Result<()> {
        self.teardown(message.host_id, plugin);

        let root = self.agent_root(message.host_id, plugin)?;
        let instance = Arc::new(
            PluginInstance::new(
                plugin,
                self.plugins.create_plugin(plugin)?,
                root,
                self.manager.clone(),
                self.plugins.registry(),
                self.config.update_period(),
            )?
            .with_debug(self.config.is_debug_plugin(plugin)),
        );
        info!(host_id = message.host_id, %plugin, session_id = %message.session_id, "Agent session started");
        // Registered before the callback so a failure tears it down
        self.sessions.lock().insert(
            (message.host_id, plugin.to_string()),
            AgentSession {
                session_id: message.session_id.clone(),
                instance: instance.clone(),
            },
        );
        instance.do_agent_session_start(data)
    }

    fn continue_session(&self, message: &AgentMessage, plugin: &str, data: &serde_json::Value) -> Result<()> {
        let instance = {
            let sessions = self.sessions.lock();
            match sessions.get(&(message.host_id, plugin.to_string())) {
                Some(session) if session.session_id == message.session_id => session.instance.clone(),
                _ => {
                    warn!(
                        host_id = message.host_id,
                        %plugin,
                        session_id = %message.session_id,
                        "Message for unknown agent session"
                    );
                    return Ok(());
                }
            }
        };
        instance.do_agent_session_continue(data)
    }

    /// `PluginAgentResources` record of a host and plugin, created on first use
    fn agent_root(&self, host_id: i64, plugin: &str) -> Result<RecordId> {
        let class = self
            .manager
            .registry()
            .lookup(builtin::BUILTIN_MODULE, "PluginAgentResources")
            .cloned()
            .ok_or_else(|| Error::PluginNotFound("builtin.PluginAgentResources".into()))?;
        self.manager
            .create_root_resource(&class, attrs! { "host_id" => host_id, "plugin_name" => plugin })
    }

    fn teardown(&self, host_id: i64, plugin: &str) {
        let session = self.sessions.lock().remove(&(host_id, plugin.to_string()));
        if let Some(session) = session {
            session.instance.do_teardown();
            debug!(host_id, %plugin, "Agent session torn down");
        }
    }

    fn teardown_all(&self) {
        let sessions: Vec<AgentSession> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.instance.do_teardown();
        }
    }

    /// Tear down a host's sessions and delete its agent resources. Messages
    /// from the host are dropped until it is unblacklisted.
    pub fn remove_host_resources(&self, host_id: i64) -> Result<()> {
        info!(host_id, "Removing host resources");
        self.blacklist.lock().insert(host_id);

        let plugins: Vec<String> = self
            .sessions
            .lock()
            .keys()
            .filter(|(h, _)| *h == host_id)
            .map(|(_, p)| p.clone())
            .collect();
        for plugin in plugins {
            self.teardown(host_id, &plugin);
        }

        let roots = self.manager.records_with_attribute(
            builtin::PLUGIN_AGENT_RESOURCES,
            "host_id",
            &host_id.into(),
        );
        for root in roots {
            self.manager.global_remove_resource(root)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use serde_json::json;

    fn message(host_id: i64, session_id: &str, counter: u64, data: serde_json::Value) -> AgentMessage {
        AgentMessage {
            host_id,
            session_id: session_id.into(),
            counter,
            updates: [("linux".to_string(), data)].into_iter().collect(),
        }
    }

    fn inventory(paths: &[&str]) -> serde_json::Value {
        json!({
            "devices": [{"serial": "S1", "size": 4096}],
            "nodes": paths.iter().map(|p| json!({"path": p, "serial": "S1"})).collect::<Vec<_>>()
        })
    }

    fn daemon(h: &Harness) -> Arc<AgentDaemon> {
        AgentDaemon::new(h.plugins.clone(), h.manager.clone(), DaemonConfig::default())
    }

    #[test]
    fn test_message_wire_format() {
        let message: AgentMessage = serde_json::from_value(json!({
            "host_id": 3,
            "session_id": "abc",
            "counter": 1,
            "updates": {"linux": {"devices": []}}
        }))
        .unwrap();
        assert_eq!(message.updates.len(), 1);
        let empty: AgentMessage =
            serde_json::from_value(json!({"host_id": 3, "session_id": "abc", "counter": 2})).unwrap();
        assert!(empty.updates.is_empty());
    }

    #[tokio::test]
    async fn test_session_start_and_continue() {
        let h = Harness::new();
        let agents = daemon(&h);

        agents.on_message(message(1, "s1", 1, inventory(&["/dev/sda"])));
        assert!(agents.has_session(1, "linux"));
        assert_eq!(node_paths(&h), vec!["/dev/sda"]);

        agents.on_message(message(1, "s1", 2, inventory(&["/dev/sdb"])));
        assert_eq!(node_paths(&h), vec!["/dev/sdb"]);

        // Unknown session ids are dropped
        agents.on_message(message(1, "other", 3, inventory(&[])));
        assert_eq!(node_paths(&h), vec!["/dev/sdb"]);
        assert!(agents.has_session(1, "linux"));

        // A restarted agent replaces the session
        agents.on_message(message(1, "s2", 1, inventory(&["/dev/sdc"])));
        assert_eq!(node_paths(&h), vec!["/dev/sdc"]);
        agents.teardown_all();
        assert_eq!(agents.session_count(), 0);
    }

    fn node_paths(h: &Harness) -> Vec<String> {
        let mut paths: Vec<String> = h.volume_nodes().into_iter().map(|n| n.path).collect();
        paths.sort();
        paths
    }

    #[tokio::test]
    async fn test_callback_failure_tears_down() {
        let h = Harness::new();
        let agents = daemon(&h);
        agents.on_message(message(2, "s1", 1, inventory(&["/dev/sda"])));
        agents.on_message(message(2, "s1", 2, json!({"devices": "bogus"})));
        assert!(!agents.has_session(2, "linux"));

        let root = h.find("builtin", "PluginAgentResources", "host_id", 2i64).unwrap();
        assert!(h.manager.session_for(root).is_none());
    }

    #[tokio::test]
    async fn test_remove_host_resources() {
        let h = Harness::new();
        let agents = daemon(&h);
        agents.on_message(message(3, "s1", 1, inventory(&["/dev/sda"])));
        assert_eq!(h.volumes().len(), 1);

        agents.remove_host_resources(3).unwrap();
        assert!(agents.is_blacklisted(3));
        assert!(!agents.has_session(3, "linux"));
        assert!(h.find("builtin", "PluginAgentResources", "host_id", 3i64).is_none());
        assert!(h.volumes().is_empty());

        agents.on_message(message(3, "s2", 1, inventory(&["/dev/sda"])));
        assert!(!agents.has_session(3, "linux"));

        agents.unblacklist_host(3);
        agents.on_message(message(3, "s2", 1, inventory(&["/dev/sda"])));
        assert!(agents.has_session(3, "linux"));
        agents.teardown_all();
    }

    #[tokio::test]
    async fn test_run_consumes_queue() {
        let h = Harness::new();
        let agents = daemon(&h);
        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(agents.clone().run(rx, shutdown.clone()));

        tx.send(message(4, "s1", 1, inventory(&["/dev/sda"]))).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(node_paths(&h), vec!["/dev/sda"]);
        // Queue closed, sessions torn down
        assert_eq!(agents.session_count(), 0);
    }
}
