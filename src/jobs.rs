//! Job Scheduler
//!
//! The resource manager asks the job scheduler for managed hosts backing
//! newly reported virtual machines. Calls never block on the scheduler:
//! host ids are allocated locally and the creation request is queued.

use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Host bookkeeping the resource manager depends on
pub trait JobScheduler: Send + Sync {
    /// Existing host registered for an address
    fn find_host_by_address(&self, address: &str) -> Option<i64>;

    /// Register a placeholder host for an address, returning its id
    fn create_host(&self, address: &str) -> Result<i64>;
}

/// Request queued for the job scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobRequest {
    CreateHost { host_id: i64, address: String },
}

// =============================================================================
// Queued Job Scheduler
// =============================================================================

/// Allocates host ids in memory and forwards requests over a channel
#[derive(Debug)]
pub struct QueuedJobScheduler {
    hosts: DashMap<String, i64>,
    next_host_id: AtomicI64,
    requests: mpsc::UnboundedSender<JobRequest>,
}

impl QueuedJobScheduler {
    /// Create a scheduler and the receiving end of its request queue
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                hosts: DashMap::new(),
                next_host_id: AtomicI64::new(1),
                requests: tx,
            },
            rx,
        )
    }

    /// Register a host known before startup
    pub fn register_host(&self, address: impl Into<String>, host_id: i64) {
        self.hosts.insert(address.into(), host_id);
        self.next_host_id.fetch_max(host_id + 1, Ordering::SeqCst);
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

impl JobScheduler for QueuedJobScheduler {
    fn find_host_by_address(&self, address: &str) -> Option<i64> {
        self.hosts.get(address).map(|h| *h)
    }

    fn create_host(&self, address: &str) -> Result<i64> {
        let host_id = match self.hosts.entry(address.to_string()) {
            Entry::Occupied(entry) => return Ok(*entry.get()),
            Entry::Vacant(entry) => *entry.insert(self.next_host_id.fetch_add(1, Ordering::SeqCst)),
        };
        self.requests
            .send(JobRequest::CreateHost {
                host_id,
                address: address.to_string(),
            })
            .map_err(|_| Error::Internal("job scheduler queue closed".into()))?;
        debug!(%address, host_id, "Queued host creation");
        Ok(host_id)
    }
}
