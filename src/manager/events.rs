//! Resource Manager Events
//!
//! Broadcast after each committed entry point so query surfaces and
//! dashboards can follow the graph without polling the store.

use crate::store::{AlertId, RecordId, VolumeId, VolumeNodeId};
use serde::{Deserialize, Serialize};

/// Events emitted by the resource manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceEvent {
    /// A session was opened for a scannable
    SessionOpened {
        scannable_id: RecordId,
        resource_count: usize,
    },

    /// A session was closed
    SessionClosed { scannable_id: RecordId },

    /// A session was replaced by a newer one for the same scannable
    SessionSuperseded { scannable_id: RecordId },

    /// A resource record was created
    RecordCreated {
        record_id: RecordId,
        class_name: String,
    },

    /// A resource record was removed
    RecordRemoved {
        record_id: RecordId,
        class_name: String,
    },

    /// A parent edge was refused because it would close a cycle
    EdgeRejected { child: RecordId, parent: RecordId },

    /// A Volume was derived
    VolumeCreated {
        volume_id: VolumeId,
        storage_resource: RecordId,
        label: String,
    },

    /// A Volume was removed
    VolumeRemoved { volume_id: VolumeId },

    /// A VolumeNode was derived
    VolumeNodeCreated {
        volume_node_id: VolumeNodeId,
        volume_id: VolumeId,
        host_id: i64,
        path: String,
    },

    /// A VolumeNode was removed
    VolumeNodeRemoved { volume_node_id: VolumeNodeId },

    /// An alert became active
    AlertRaised {
        alert_id: AlertId,
        record_id: Option<RecordId>,
        alert_class: String,
    },

    /// An alert became inactive
    AlertLowered {
        alert_id: AlertId,
        alert_class: String,
    },
}

impl ResourceEvent {
    /// Record the event is about, if any
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            ResourceEvent::SessionOpened { scannable_id, .. }
            | ResourceEvent::SessionClosed { scannable_id }
            | ResourceEvent::SessionSuperseded { scannable_id } => Some(*scannable_id),
            ResourceEvent::RecordCreated { record_id, .. }
            | ResourceEvent::RecordRemoved { record_id, .. } => Some(*record_id),
            ResourceEvent::EdgeRejected { child, .. } => Some(*child),
            ResourceEvent::VolumeCreated {
                storage_resource, ..
            } => Some(*storage_resource),
            ResourceEvent::AlertRaised { record_id, .. } => *record_id,
            _ => None,
        }
    }

    pub fn is_alert_event(&self) -> bool {
        matches!(
            self,
            ResourceEvent::AlertRaised { .. } | ResourceEvent::AlertLowered { .. }
        )
    }

    pub fn is_volume_event(&self) -> bool {
        matches!(
            self,
            ResourceEvent::VolumeCreated { .. }
                | ResourceEvent::VolumeRemoved { .. }
                | ResourceEvent::VolumeNodeCreated { .. }
                | ResourceEvent::VolumeNodeRemoved { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ResourceEvent::RecordCreated {
            record_id: RecordId(5),
            class_name: "ScsiDevice".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "record_created");
        assert_eq!(json["record_id"], 5);

        let back: ResourceEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.record_id(), Some(RecordId(5)));
    }

    #[test]
    fn test_event_helpers() {
        let raised = ResourceEvent::AlertRaised {
            alert_id: AlertId(1),
            record_id: Some(RecordId(10)),
            alert_class: "A1".into(),
        };
        assert!(raised.is_alert_event());
        assert!(!raised.is_volume_event());
        assert_eq!(raised.record_id(), Some(RecordId(10)));

        let removed = ResourceEvent::VolumeRemoved {
            volume_id: VolumeId(3),
        };
        assert!(removed.is_volume_event());
        assert_eq!(removed.record_id(), None);
    }
}
