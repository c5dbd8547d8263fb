//! Resource Manager Metrics

use super::events::ResourceEvent;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained from committed events
#[derive(Debug, Default)]
pub struct ManagerMetrics {
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub sessions_superseded: AtomicU64,
    pub stale_session_rejections: AtomicU64,
    pub records_created: AtomicU64,
    pub records_removed: AtomicU64,
    pub edges_rejected: AtomicU64,
    pub volumes_created: AtomicU64,
    pub volumes_removed: AtomicU64,
    pub volume_nodes_created: AtomicU64,
    pub volume_nodes_removed: AtomicU64,
    pub alerts_raised: AtomicU64,
    pub alerts_lowered: AtomicU64,
}

impl ManagerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a committed event
    pub fn observe(&self, event: &ResourceEvent) {
        let counter = match event {
            ResourceEvent::SessionOpened { .. } => &self.sessions_opened,
            ResourceEvent::SessionClosed { .. } => &self.sessions_closed,
            ResourceEvent::SessionSuperseded { .. } => &self.sessions_superseded,
            ResourceEvent::RecordCreated { .. } => &self.records_created,
            ResourceEvent::RecordRemoved { .. } => &self.records_removed,
            ResourceEvent::EdgeRejected { .. } => &self.edges_rejected,
            ResourceEvent::VolumeCreated { .. } => &self.volumes_created,
            ResourceEvent::VolumeRemoved { .. } => &self.volumes_removed,
            ResourceEvent::VolumeNodeCreated { .. } => &self.volume_nodes_created,
            ResourceEvent::VolumeNodeRemoved { .. } => &self.volume_nodes_removed,
            ResourceEvent::AlertRaised { .. } => &self.alerts_raised,
            ResourceEvent::AlertLowered { .. } => &self.alerts_lowered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_rejection(&self) {
        self.stale_session_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ManagerMetricsSnapshot {
        ManagerMetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            sessions_superseded: self.sessions_superseded.load(Ordering::Relaxed),
            stale_session_rejections: self.stale_session_rejections.load(Ordering::Relaxed),
            records_created: self.records_created.load(Ordering::Relaxed),
            records_removed: self.records_removed.load(Ordering::Relaxed),
            edges_rejected: self.edges_rejected.load(Ordering::Relaxed),
            volumes_created: self.volumes_created.load(Ordering::Relaxed),
            volumes_removed: self.volumes_removed.load(Ordering::Relaxed),
            volume_nodes_created: self.volume_nodes_created.load(Ordering::Relaxed),
            volume_nodes_removed: self.volume_nodes_removed.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            alerts_lowered: self.alerts_lowered.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ManagerMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerMetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_superseded: u64,
    pub stale_session_rejections: u64,
    pub records_created: u64,
    pub records_removed: u64,
    pub edges_rejected: u64,
    pub volumes_created: u64,
    pub volumes_removed: u64,
    pub volume_nodes_created: u64,
    pub volume_nodes_removed: u64,
    pub alerts_raised: u64,
    pub alerts_lowered: u64,
}

impl ManagerMetricsSnapshot {
    /// Counter name and value pairs, for exposition
    pub fn counters(&self) -> [(&'static str, u64); 13] {
        [
            ("sessions_opened", self.sessions_opened),
            ("sessions_closed", self.sessions_closed),
            ("sessions_superseded", self.sessions_superseded),
            ("stale_session_rejections", self.stale_session_rejections),
            ("records_created", self.records_created),
            ("records_removed", self.records_removed),
            ("edges_rejected", self.edges_rejected),
            ("volumes_created", self.volumes_created),
            ("volumes_removed", self.volumes_removed),
            ("volume_nodes_created", self.volume_nodes_created),
            ("volume_nodes_removed", self.volume_nodes_removed),
            ("alerts_raised", self.alerts_raised),
            ("alerts_lowered", self.alerts_lowered),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RecordId, VolumeId};

    #[test]
    fn test_observe_events() {
        let metrics = ManagerMetrics::new();
        metrics.observe(&ResourceEvent::RecordCreated {
            record_id: RecordId(1),
            class_name: "ScsiDevice".into(),
        });
        metrics.observe(&ResourceEvent::VolumeRemoved {
            volume_id: VolumeId(2),
        });
        metrics.record_stale_rejection();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_created, 1);
        assert_eq!(snapshot.volumes_removed, 1);
        assert_eq!(snapshot.stale_session_rejections, 1);
        assert_eq!(snapshot.alerts_raised, 0);
        assert_eq!(snapshot.counters().len(), 13);
    }
}
