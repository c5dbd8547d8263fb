use super::*;
use crate::attrs;
use crate::jobs::JobRequest;
use crate::testing::Harness;
use assert_matches::assert_matches;
use tempfile::TempDir;

fn disk(h: &Harness, handle: u64, serial: &str, size: i64) -> ReportedResource {
    h.resource(handle, "linux", "ScsiDevice", attrs! { "serial" => serial, "size" => size }, &[])
}

fn node(h: &Harness, handle: u64, host_id: i64, path: &str, parent: u64) -> ReportedResource {
    h.resource(
        handle,
        "linux",
        "LinuxDeviceNode",
        attrs! { "host_id" => host_id, "path" => path },
        &[parent],
    )
}

fn node_paths(h: &Harness) -> Vec<(i64, String)> {
    let mut paths: Vec<_> = h
        .volume_nodes()
        .into_iter()
        .map(|n| (n.host_id, n.path))
        .collect();
    paths.sort();
    paths
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn test_subscription_links_across_sessions() {
    let h = Harness::new();
    let host = h.host(42);
    h.open(host, vec![h.resource(2, "linux", "LinuxDeviceNode", attrs! { "host_id" => 42, "path" => "/dev/foo" }, &[])]);

    let controller = h.controller("subscription_plugin", "10.0.0.1");
    let key = h.open(
        controller,
        vec![
            h.resource(
                2,
                "subscription_plugin",
                "Presentation",
                attrs! { "lun_id" => "lun1", "host_id" => 42, "path" => "/dev/foo" },
                &[],
            ),
            h.resource(3, "subscription_plugin", "Lun", attrs! { "lun_id" => "lun1" }, &[]),
        ],
    );

    let node_id = h.find("linux", "LinuxDeviceNode", "path", "/dev/foo").unwrap();
    let presentation = h.find("subscription_plugin", "Presentation", "lun_id", "lun1").unwrap();
    let lun = h.find("subscription_plugin", "Lun", "lun_id", "lun1").unwrap();
    assert_eq!(h.manager.parents_of(node_id), vec![presentation]);
    assert_eq!(h.manager.parents_of(presentation), vec![lun]);

    let before = h.record_ids().len();
    h.manager
        .session_remove_global_resources(&key, &[LocalHandle(2)])
        .unwrap();
    let after = h.record_ids();
    assert_eq!(after.len(), before - 1);
    assert!(!after.contains(&presentation));
    assert!(after.contains(&lun));
    assert!(after.contains(&node_id));
    assert!(h.manager.parents_of(node_id).is_empty());
}

#[tokio::test]
async fn test_update_reindexes_subscriptions() {
    let h = Harness::new();
    let host = h.host(3);
    h.open(host, vec![node(&h, 2, 3, "/dev/foo", 1)]);
    let controller = h.controller("subscription_plugin", "10.0.0.2");
    let key = h.open(
        controller,
        vec![h.resource(
            2,
            "subscription_plugin",
            "Presentation",
            attrs! { "lun_id" => "lun9", "host_id" => 3, "path" => "/dev/bar" },
            &[],
        )],
    );
    let node_id = h.find("linux", "LinuxDeviceNode", "path", "/dev/foo").unwrap();
    let presentation = h.find("subscription_plugin", "Presentation", "lun_id", "lun9").unwrap();
    assert!(!h.manager.parents_of(node_id).contains(&presentation));

    let path = h
        .class("subscription_plugin", "Presentation")
        .prepare("path", "/dev/foo".into())
        .unwrap();
    h.manager
        .session_update_resource(&key, LocalHandle(2), &attrs! { "path" => path })
        .unwrap();
    assert!(h.manager.parents_of(node_id).contains(&presentation));
}

// =============================================================================
// Volumes
// =============================================================================

#[tokio::test]
async fn test_volume_derivation_and_removal() {
    let h = Harness::new();
    let host = h.host(1);
    h.open(host, vec![disk(&h, 2, "S1", 4096), node(&h, 3, 1, "/dev/foo", 2)]);

    let volumes = h.volumes();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].size, Some(4096));
    assert_eq!(volumes[0].label, "S1");
    assert!(volumes[0].usable_for_lustre);
    let nodes = h.volume_nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].volume_id, volumes[0].id);
    assert_eq!((nodes[0].host_id, nodes[0].path.as_str()), (1, "/dev/foo"));

    h.open(host, vec![]);
    assert!(h.volumes().is_empty());
    assert!(h.volume_nodes().is_empty());
    assert!(h.find("linux", "ScsiDevice", "serial", "S1").is_none());
    let metrics = h.manager.metrics();
    assert_eq!(metrics.volumes_removed, 1);
    assert_eq!(metrics.volume_nodes_removed, 1);
}

#[tokio::test]
async fn test_mapper_path_preferred() {
    let h = Harness::new();
    let host = h.host(7);
    h.open(
        host,
        vec![
            disk(&h, 2, "S3", 1024),
            node(&h, 3, 7, "/dev/sda", 2),
            node(&h, 4, 7, "/dev/mapper/mpatha", 2),
        ],
    );
    assert_eq!(h.volumes().len(), 1);
    assert_eq!(node_paths(&h), vec![(7, "/dev/mapper/mpatha".to_string())]);
}

#[tokio::test]
async fn test_mapper_path_replaces_plain_node() {
    let h = Harness::new();
    let host = h.host(7);
    let key = h.open(host, vec![disk(&h, 2, "S3", 1024), node(&h, 3, 7, "/dev/sda", 2)]);
    assert_eq!(node_paths(&h), vec![(7, "/dev/sda".to_string())]);

    h.manager
        .session_add_resources(&key, &[node(&h, 4, 7, "/dev/mapper/mpatha", 2)])
        .unwrap();
    assert_eq!(h.volumes().len(), 1);
    assert_eq!(node_paths(&h), vec![(7, "/dev/mapper/mpatha".to_string())]);
}

#[tokio::test]
async fn test_stacked_node_hides_lower_node() {
    let h = Harness::new();
    let host = h.host(2);
    let key = h.open(host, vec![disk(&h, 2, "S4", 1024), node(&h, 3, 2, "/dev/sdb", 2)]);
    assert_eq!(node_paths(&h), vec![(2, "/dev/sdb".to_string())]);

    // A node stacked on /dev/sdb makes it unusable
    h.manager
        .session_add_resources(&key, &[node(&h, 4, 2, "/dev/dm-0", 3)])
        .unwrap();
    assert_eq!(node_paths(&h), vec![(2, "/dev/dm-0".to_string())]);
}

#[tokio::test]
async fn test_partition_cascade() {
    let h = Harness::new();
    let host = h.host(5);
    h.open(
        host,
        vec![
            disk(&h, 2, "S5", 8192),
            h.resource(
                3,
                "linux",
                "Partition",
                attrs! { "container" => LocalHandle(2), "number" => 1, "size" => 100 },
                &[2],
            ),
            h.resource(
                4,
                "linux",
                "LinuxDeviceNode",
                attrs! { "host_id" => 5, "path" => "/dev/sda1", "logical_drive" => LocalHandle(3) },
                &[3],
            ),
        ],
    );
    let device = h.find("linux", "ScsiDevice", "serial", "S5").unwrap();
    let partition = h.find("linux", "Partition", "number", 1i64).unwrap();
    let volumes = h.volumes();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].storage_resource, Some(partition));
    assert_eq!(volumes[0].label, "Partition 1");
    assert_eq!(volumes[0].size, Some(100));
    assert_eq!(h.volume_nodes().len(), 1);

    h.manager.global_remove_resource(device).unwrap();
    let remaining = h.record_ids();
    assert!(!remaining.contains(&device));
    assert!(!remaining.contains(&partition));
    assert!(h.find("linux", "LinuxDeviceNode", "path", "/dev/sda1").is_none());
    assert!(h.volumes().is_empty());
    assert!(h.volume_nodes().is_empty());
}

#[tokio::test]
async fn test_global_resource_shared_by_hosts() {
    let h = Harness::new();
    let a = h.host(1);
    let b = h.host(2);
    h.open(a, vec![disk(&h, 2, "S6", 1024), node(&h, 3, 1, "/dev/sdb", 2)]);
    h.open(b, vec![disk(&h, 2, "S6", 1024), node(&h, 3, 2, "/dev/sdc", 2)]);

    let device = h.find("linux", "ScsiDevice", "serial", "S6").unwrap();
    let reporters = |h: &Harness| h.manager.store().read(|t| t.record(device).map(|r| r.reported_by.clone()));
    assert_eq!(reporters(&h).unwrap().len(), 2);
    assert_eq!(h.volumes().len(), 1);
    assert_eq!(node_paths(&h).len(), 2);

    h.open(a, vec![]);
    assert_eq!(reporters(&h).unwrap().into_iter().collect::<Vec<_>>(), vec![b]);
    assert_eq!(h.volumes().len(), 1);
    assert_eq!(node_paths(&h), vec![(2, "/dev/sdc".to_string())]);

    h.open(b, vec![]);
    assert!(reporters(&h).is_none());
    assert!(h.volumes().is_empty());
    assert!(h.volume_nodes().is_empty());
}

#[tokio::test]
async fn test_claimed_volume_survives_without_nodes() {
    let h = Harness::new();
    let host = h.host(9);
    let key = h.open(host, vec![disk(&h, 2, "S7", 1024), node(&h, 3, 9, "/dev/sdd", 2)]);
    let volume = h.volumes()[0].id;
    h.manager.set_volume_claimed(volume, true).unwrap();

    h.manager
        .session_remove_local_resources(&key, &[LocalHandle(3)])
        .unwrap();
    assert!(h.volume_nodes().is_empty());
    assert_eq!(h.volumes().len(), 1);

    h.manager.set_volume_claimed(volume, false).unwrap();
    assert!(h.volumes().is_empty());
}

// =============================================================================
// Session semantics
// =============================================================================

#[tokio::test]
async fn test_replayed_open_is_idempotent() {
    let h = Harness::new();
    let host = h.host(1);
    let payload = || vec![disk(&h, 2, "S1", 4096), node(&h, 3, 1, "/dev/foo", 2)];
    h.open(host, payload());
    let records = h.record_ids();
    let volumes = h.volumes();
    let nodes = h.volume_nodes();
    let created = h.manager.metrics().records_created;

    let key = h.open(host, payload());
    assert_eq!(h.record_ids(), records);
    assert_eq!(h.volumes(), volumes);
    assert_eq!(h.volume_nodes(), nodes);
    assert_eq!(h.manager.metrics().records_created, created);
    assert_eq!(h.manager.session_for(host), Some(key));
}

#[tokio::test]
async fn test_add_then_remove_restores_state() {
    let h = Harness::new();
    let host = h.host(1);
    let key = h.open(host, vec![disk(&h, 2, "S1", 4096), node(&h, 3, 1, "/dev/foo", 2)]);
    let records = h.record_ids();
    let volumes = h.volumes();
    let nodes = h.volume_nodes();

    h.manager
        .session_add_resources(&key, &[node(&h, 4, 1, "/dev/sdx", 2)])
        .unwrap();
    assert_eq!(h.volume_nodes().len(), 2);

    h.manager
        .session_remove_local_resources(&key, &[LocalHandle(4)])
        .unwrap();
    assert_eq!(h.record_ids(), records);
    assert_eq!(h.volumes(), volumes);
    assert_eq!(h.volume_nodes(), nodes);
}

#[tokio::test]
async fn test_session_update_applies_batch() {
    let h = Harness::new();
    let host = h.host(1);
    let key = h.open(host, vec![disk(&h, 2, "S1", 4096), node(&h, 3, 1, "/dev/foo", 2)]);

    let batch = SessionUpdate {
        remove_local: vec![LocalHandle(3)],
        created: vec![node(&h, 4, 1, "/dev/bar", 2)],
        attributes: vec![(LocalHandle(2), attrs! { "size" => 8192 })],
        alerts: vec![AlertNotice {
            handle: LocalHandle(4),
            active: true,
            severity: Severity::Warning,
            alert_class: "A1".into(),
            attribute: None,
        }],
        ..SessionUpdate::default()
    };
    h.manager.session_apply_update(&key, &batch).unwrap();

    assert_eq!(node_paths(&h), vec![(1, "/dev/bar".to_string())]);
    assert_eq!(h.volumes().len(), 1);
    assert!(h.find("linux", "LinuxDeviceNode", "path", "/dev/foo").is_none());
    let device = h.find("linux", "ScsiDevice", "serial", "S1").unwrap();
    let stored = h.manager.get_resource(device).unwrap();
    assert_eq!(stored.attributes.get("size"), Some(&AttrValue::Integer(8192)));

    let bar = h.find("linux", "LinuxDeviceNode", "path", "/dev/bar").unwrap();
    let subjects: Vec<AlertSubject> = h
        .manager
        .store()
        .read(|t| t.alert_states.values().filter(|a| a.active).map(|a| a.subject).collect());
    assert_eq!(subjects, vec![AlertSubject::Record(bar)]);
}

#[tokio::test]
async fn test_failed_session_update_changes_nothing() {
    let h = Harness::new();
    let host = h.host(1);
    let key = h.open(host, vec![disk(&h, 2, "S1", 4096), node(&h, 3, 1, "/dev/foo", 2)]);
    let records = h.record_ids();
    let nodes = h.volume_nodes();

    let batch = SessionUpdate {
        created: vec![node(&h, 4, 1, "/dev/bar", 2)],
        attributes: vec![(LocalHandle(2), attrs! { "colour" => "red" })],
        ..SessionUpdate::default()
    };
    assert_matches!(
        h.manager.session_apply_update(&key, &batch),
        Err(Error::UnknownAttribute { .. })
    );
    assert_eq!(h.record_ids(), records);
    assert_eq!(h.volume_nodes(), nodes);

    let retry = SessionUpdate {
        created: vec![node(&h, 4, 1, "/dev/bar", 2)],
        ..SessionUpdate::default()
    };
    h.manager.session_apply_update(&key, &retry).unwrap();
    assert_eq!(
        node_paths(&h),
        vec![(1, "/dev/bar".to_string()), (1, "/dev/foo".to_string())]
    );
}

#[tokio::test]
async fn test_stale_session_rejected() {
    let h = Harness::new();
    let host = h.host(1);
    let old = h.open(host, vec![]);
    let new = h.open(host, vec![]);
    assert_ne!(old, new);

    let result = h
        .manager
        .session_add_resources(&old, &[disk(&h, 2, "S1", 4096)]);
    assert_matches!(result, Err(Error::SessionStale { scannable_id }) if scannable_id == host);
    assert!(h.find("linux", "ScsiDevice", "serial", "S1").is_none());

    let metrics = h.manager.metrics();
    assert_eq!(metrics.stale_session_rejections, 1);
    assert_eq!(metrics.sessions_superseded, 1);

    h.manager.session_close(&new);
    assert_eq!(h.manager.session_for(host), None);
    assert_matches!(
        h.manager.session_remove_local_resources(&new, &[LocalHandle(2)]),
        Err(Error::SessionStale { .. })
    );
}

#[tokio::test]
async fn test_open_requires_scannable() {
    let h = Harness::new();
    let host = h.host(1);
    h.open(host, vec![disk(&h, 2, "S1", 4096)]);
    let device = h.find("linux", "ScsiDevice", "serial", "S1").unwrap();
    assert_matches!(h.try_open(device, vec![]), Err(Error::Internal(_)));
}

#[tokio::test]
async fn test_cycle_rejected() {
    let h = Harness::new();
    let host = h.host(1);
    let key = h.open(host, vec![disk(&h, 2, "S1", 4096), node(&h, 3, 1, "/dev/foo", 2)]);
    let device = h.find("linux", "ScsiDevice", "serial", "S1").unwrap();

    h.manager
        .session_resource_add_parent(&key, LocalHandle(2), LocalHandle(3))
        .unwrap();
    assert!(h.manager.parents_of(device).is_empty());
    assert_eq!(h.manager.metrics().edges_rejected, 1);

    // Unknown handles are a dependency race, not an error
    h.manager
        .session_resource_add_parent(&key, LocalHandle(3), LocalHandle(99))
        .unwrap();
}

#[tokio::test]
async fn test_remove_parent_updates_volume_nodes() {
    let h = Harness::new();
    let host = h.host(1);
    let key = h.open(host, vec![disk(&h, 2, "S1", 4096), node(&h, 3, 1, "/dev/foo", 2)]);
    let node_id = h.find("linux", "LinuxDeviceNode", "path", "/dev/foo").unwrap();
    assert_eq!(h.volume_nodes().len(), 1);

    h.manager
        .session_resource_remove_parent(&key, LocalHandle(3), LocalHandle(2))
        .unwrap();
    assert!(h.manager.parents_of(node_id).is_empty());
    assert_eq!(h.volumes().len(), 1);
}

#[tokio::test]
async fn test_events_broadcast_after_commit() {
    let h = Harness::new();
    let host = h.host(1);
    let mut events = h.manager.subscribe();
    h.open(host, vec![disk(&h, 2, "S1", 4096), node(&h, 3, 1, "/dev/foo", 2)]);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen
        .iter()
        .any(|e| matches!(e, ResourceEvent::RecordCreated { class_name, .. } if class_name == "ScsiDevice")));
    assert!(seen.iter().any(|e| matches!(e, ResourceEvent::VolumeCreated { .. })));
    assert_matches!(seen.last(), Some(ResourceEvent::SessionOpened { scannable_id, resource_count: 3 }) if *scannable_id == host);

    // Failed transactions publish nothing
    let _ = h.manager.session_add_resources(
        &SessionKey {
            scannable_id: host,
            epoch: 0,
        },
        &[],
    );
    assert!(events.try_recv().is_err());
}

// =============================================================================
// Administrative
// =============================================================================

#[tokio::test]
async fn test_modify_resource_drops_session() {
    let h = Harness::new();
    let controller = h.controller("alert_plugin", "ctrl-a");
    h.open(controller, vec![]);
    assert!(h.manager.session_for(controller).is_some());

    h.manager
        .modify_resource(controller, &attrs! { "temperature" => 50 })
        .unwrap();
    assert!(h.manager.session_for(controller).is_none());
    let stored = h.manager.get_resource(controller).unwrap();
    assert_eq!(stored.attributes.get("temperature"), Some(&AttrValue::Integer(50)));

    assert_matches!(
        h.manager.modify_resource(controller, &attrs! { "colour" => "red" }),
        Err(Error::UnknownAttribute { .. })
    );
}

#[tokio::test]
async fn test_remove_unknown_resource_is_logged() {
    let h = Harness::new();
    assert!(h.manager.global_remove_resource(RecordId(999)).is_ok());
    assert_matches!(
        h.manager.get_resource(RecordId(999)),
        Err(Error::RecordNotFound { .. })
    );
}

#[tokio::test]
async fn test_root_resource_is_unique() {
    let h = Harness::new();
    let first = h.controller("alert_plugin", "ctrl-b");
    let second = h.controller("alert_plugin", "ctrl-b");
    assert_eq!(first, second);
    assert!(!h.manager.get_label(first).unwrap().is_empty());
}

#[tokio::test]
async fn test_virtual_machine_gets_host() {
    let mut h = Harness::new();
    let controller = h.controller("subscription_plugin", "10.0.0.3");
    h.open(
        controller,
        vec![h.resource(2, "subscription_plugin", "Vm", attrs! { "address" => "vm1" }, &[])],
    );
    let vm = h.find("subscription_plugin", "Vm", "address", "vm1").unwrap();
    let stored = h.manager.get_resource(vm).unwrap();
    assert_eq!(stored.attributes.get("host_id"), Some(&AttrValue::Integer(1)));
    assert_eq!(
        h.job_requests.try_recv().unwrap(),
        JobRequest::CreateHost {
            host_id: 1,
            address: "vm1".into()
        }
    );

    // Already assigned, no new request
    h.open(
        controller,
        vec![h.resource(2, "subscription_plugin", "Vm", attrs! { "address" => "vm1" }, &[])],
    );
    assert!(h.job_requests.try_recv().is_err());
}

// =============================================================================
// Alerts
// =============================================================================

#[tokio::test]
async fn test_alert_raise_lower_and_propagation() {
    let h = Harness::new();
    let controller = h.controller("alert_plugin", "ctrl-a");
    let key = h.open(
        controller,
        vec![h.resource(2, "alert_plugin", "Lun", attrs! { "lun_id" => "L1" }, &[1])],
    );
    let lun = h.find("alert_plugin", "Lun", "lun_id", "L1").unwrap();

    h.manager
        .session_notify_alert(&key, LocalHandle(1), true, Severity::Error, "A1", None)
        .unwrap();
    let (alerts, propagated) = h
        .manager
        .store()
        .read(|t| (t.alert_states.values().cloned().collect::<Vec<_>>(), t.alert_propagated.clone()));
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].active);
    assert_eq!(alerts[0].subject, AlertSubject::Record(controller));
    assert_eq!(propagated.get(&alerts[0].id).cloned().unwrap_or_default().into_iter().collect::<Vec<_>>(), vec![lun]);

    // Raising again only extends the window
    h.manager
        .session_notify_alert(&key, LocalHandle(1), true, Severity::Error, "A1", None)
        .unwrap();
    assert_eq!(h.manager.store().read(|t| t.alert_states.len()), 1);

    h.manager
        .session_notify_alert(&key, LocalHandle(1), false, Severity::Error, "A1", None)
        .unwrap();
    let (alerts, propagated) = h
        .manager
        .store()
        .read(|t| (t.alert_states.values().cloned().collect::<Vec<_>>(), t.alert_propagated.clone()));
    assert!(!alerts[0].active);
    assert!(alerts[0].end >= alerts[0].begin);
    assert!(propagated.is_empty());

    // Lowering an inactive alert is a no-op
    h.manager
        .session_notify_alert(&key, LocalHandle(1), false, Severity::Error, "A1", None)
        .unwrap();
    assert_eq!(h.manager.metrics().alerts_lowered, 1);

    h.manager
        .session_notify_alert(&key, LocalHandle(1), true, Severity::Warning, "A1", None)
        .unwrap();
    assert_eq!(h.manager.store().read(|t| t.alert_states.len()), 2);

    h.manager.global_remove_resource(controller).unwrap();
    assert!(h.manager.store().read(|t| t.alert_states.values().all(|a| !a.active)));
    assert!(!h.record_ids().contains(&lun));
}

#[tokio::test]
async fn test_alert_for_unknown_handle_ignored() {
    let h = Harness::new();
    let controller = h.controller("alert_plugin", "ctrl-c");
    let key = h.open(controller, vec![]);
    h.manager
        .session_notify_alert(&key, LocalHandle(50), true, Severity::Error, "A1", None)
        .unwrap();
    assert_eq!(h.manager.store().read(|t| t.alert_states.len()), 0);
}

#[tokio::test]
async fn test_offline_alert() {
    let h = Harness::new();
    let controller = h.controller("alert_plugin", "ctrl-d");
    h.manager.notify_offline(controller, true).unwrap();
    h.manager.notify_offline(controller, true).unwrap();
    let active = |h: &Harness| {
        h.manager.store().read(|t| {
            t.alert_states
                .values()
                .filter(|a| a.active && a.kind == AlertKind::Offline)
                .count()
        })
    };
    assert_eq!(active(&h), 1);

    h.manager.notify_offline(controller, false).unwrap();
    assert_eq!(active(&h), 0);
}

// =============================================================================
// Network projection
// =============================================================================

#[tokio::test]
async fn test_nid_projection_and_change_alert() {
    let h = Harness::new();
    let host = h.agent_root(4, "linux_network");
    let key = h.open(
        host,
        vec![
            h.resource(
                2,
                "linux_network",
                "HostNetworkInterface",
                attrs! { "name" => "eth0", "host_id" => 4, "inet4_address" => "192.168.0.4", "up" => true },
                &[],
            ),
            h.resource(
                3,
                "linux_network",
                "HostLnetModules",
                attrs! { "host_id" => 4, "state" => "up" },
                &[],
            ),
            h.resource(
                4,
                "linux_network",
                "HostLnetInterface",
                attrs! { "name" => "eth0", "lnd_network" => 0, "lnd_type" => "tcp" },
                &[2],
            ),
        ],
    );

    let (interfaces, nids, config) = h.manager.store().read(|t| {
        (
            t.network_interfaces.values().cloned().collect::<Vec<_>>(),
            t.nids_of_host(4),
            t.lnet_configurations.get(&4).map(|c| c.state.clone()),
        )
    });
    assert_eq!(interfaces.len(), 1);
    assert_eq!(interfaces[0].inet4_address.as_deref(), Some("192.168.0.4"));
    assert!(interfaces[0].state_up);
    assert_eq!(nids.len(), 1);
    assert_eq!(nids[0].lnd_type.as_deref(), Some("tcp"));
    assert_eq!(config.as_deref(), Some("up"));

    let nid_alert = |h: &Harness| {
        h.manager
            .store()
            .read(|t| t.active_alert(AlertSubject::Host(4), AlertKind::LnetNidsChanged))
    };
    assert!(nid_alert(&h).is_none());

    h.manager
        .session_update_resource(&key, LocalHandle(4), &attrs! { "lnd_type" => "o2ib" })
        .unwrap();
    assert!(nid_alert(&h).is_some());

    h.manager
        .session_update_resource(&key, LocalHandle(4), &attrs! { "lnd_type" => "o2ib" })
        .unwrap();
    assert!(nid_alert(&h).is_none());

    h.manager
        .session_remove_local_resources(&key, &[LocalHandle(2)])
        .unwrap();
    assert!(h
        .manager
        .store()
        .read(|t| t.network_interfaces.is_empty() && t.nids.is_empty()));
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.json");

    let (records, volumes) = {
        let h = Harness::with_store(Arc::new(Store::open(&path).unwrap()));
        let host = h.host(1);
        h.open(host, vec![disk(&h, 2, "S1", 4096), node(&h, 3, 1, "/dev/foo", 2)]);
        (h.record_ids(), h.volumes())
    };

    let h = Harness::with_store(Arc::new(Store::open(&path).unwrap()));
    assert_eq!(h.record_ids(), records);
    assert_eq!(h.volumes(), volumes);
    let device = h.find("linux", "ScsiDevice", "serial", "S1").unwrap();
    let node_id = h.find("linux", "LinuxDeviceNode", "path", "/dev/foo").unwrap();
    assert_eq!(h.manager.parents_of(node_id), vec![device]);

    // Sessions do not survive; replaying the inventory changes nothing
    let host = h.host(1);
    assert!(h.manager.session_for(host).is_none());
    h.open(host, vec![disk(&h, 2, "S1", 4096), node(&h, 3, 1, "/dev/foo", 2)]);
    assert_eq!(h.record_ids(), records);
    assert_eq!(h.manager.metrics().records_created, 0);
}
