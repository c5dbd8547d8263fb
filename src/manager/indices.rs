//! In-memory indices guarded by the manager mutex

use crate::metamodel::{AttrMap, AttrValue, LocalHandle, ResourceClass};
use crate::plugin::ClassRegistry;
use crate::store::{AlertId, ClassId, RecordId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

// =============================================================================
// Sessions
// =============================================================================

/// Identifies one open session; stale keys are rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub scannable_id: RecordId,
    pub epoch: u64,
}

/// Per-scannable session state
#[derive(Debug, Clone)]
pub struct Session {
    pub scannable_id: RecordId,
    pub epoch: u64,
    pub update_period: Duration,
    pub host_id: Option<i64>,
    pub local_to_global: HashMap<LocalHandle, RecordId>,
    pub global_to_local: HashMap<RecordId, LocalHandle>,
}

impl Session {
    pub fn new(scannable_id: RecordId, epoch: u64, update_period: Duration, host_id: Option<i64>) -> Self {
        Self {
            scannable_id,
            epoch,
            update_period,
            host_id,
            local_to_global: HashMap::new(),
            global_to_local: HashMap::new(),
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            scannable_id: self.scannable_id,
            epoch: self.epoch,
        }
    }

    pub fn map(&mut self, local: LocalHandle, global: RecordId) {
        self.local_to_global.insert(local, global);
        self.global_to_local.insert(global, local);
    }

    pub fn forget_global(&mut self, global: RecordId) {
        if let Some(local) = self.global_to_local.remove(&global) {
            self.local_to_global.remove(&local);
        }
    }

    pub fn forget_local(&mut self, local: LocalHandle) {
        if let Some(global) = self.local_to_global.remove(&local) {
            self.global_to_local.remove(&global);
        }
    }
}

// =============================================================================
// Edges
// =============================================================================

/// Bidirectional parent/child adjacency over record ids
#[derive(Debug, Clone, Default)]
pub struct EdgeIndex {
    parents: BTreeMap<RecordId, BTreeSet<RecordId>>,
    children: BTreeMap<RecordId, BTreeSet<RecordId>>,
}

impl EdgeIndex {
    pub fn add_parent(&mut self, child: RecordId, parent: RecordId) -> bool {
        self.children.entry(parent).or_default().insert(child);
        self.parents.entry(child).or_default().insert(parent)
    }

    pub fn remove_parent(&mut self, child: RecordId, parent: RecordId) -> bool {
        if let Some(c) = self.children.get_mut(&parent) {
            c.remove(&child);
        }
        self.parents
            .get_mut(&child)
            .map_or(false, |p| p.remove(&parent))
    }

    pub fn has_parent(&self, child: RecordId, parent: RecordId) -> bool {
        self.parents
            .get(&child)
            .map_or(false, |p| p.contains(&parent))
    }

    pub fn get_parents(&self, record: RecordId) -> Vec<RecordId> {
        self.parents
            .get(&record)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get_children(&self, record: RecordId) -> Vec<RecordId> {
        self.children
            .get(&record)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_children(&self, record: RecordId) -> bool {
        self.children.get(&record).map_or(false, |c| !c.is_empty())
    }

    /// Drop every edge touching `record`
    pub fn remove_node(&mut self, record: RecordId) {
        for parent in self.parents.remove(&record).unwrap_or_default() {
            if let Some(c) = self.children.get_mut(&parent) {
                c.remove(&record);
            }
        }
        for child in self.children.remove(&record).unwrap_or_default() {
            if let Some(p) = self.parents.get_mut(&child) {
                p.remove(&record);
            }
        }
    }

    /// True if making `parent` a parent of `child` would close a cycle
    pub fn would_cycle(&self, child: RecordId, parent: RecordId) -> bool {
        child == parent || self.ancestors(parent).contains(&child)
    }

    /// Every record reachable through parent edges, excluding `record`
    pub fn ancestors(&self, record: RecordId) -> BTreeSet<RecordId> {
        self.reach(record, &self.parents)
    }

    /// Every record reachable through child edges, excluding `record`
    pub fn descendants(&self, record: RecordId) -> BTreeSet<RecordId> {
        self.reach(record, &self.children)
    }

    fn reach(
        &self,
        start: RecordId,
        adjacency: &BTreeMap<RecordId, BTreeSet<RecordId>>,
    ) -> BTreeSet<RecordId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(r) = stack.pop() {
            for next in adjacency.get(&r).into_iter().flatten() {
                if *next != start && seen.insert(*next) {
                    stack.push(*next);
                }
            }
        }
        seen
    }
}

// =============================================================================
// Subscriber Index
// =============================================================================

type SubscriptionSlot = (String, Vec<AttrValue>);

/// Matches providers to subscribers by relation key and attribute values
#[derive(Debug, Clone, Default)]
pub struct SubscriberIndex {
    providers: HashMap<SubscriptionSlot, BTreeSet<RecordId>>,
    subscribers: HashMap<SubscriptionSlot, BTreeSet<RecordId>>,
}

impl SubscriberIndex {
    /// Records that provide what `class` instances with `attrs` subscribe to
    pub fn what_provides(
        &self,
        registry: &ClassRegistry,
        class: &ResourceClass,
        attrs: &AttrMap,
    ) -> BTreeSet<RecordId> {
        let mut result = BTreeSet::new();
        for sub in registry.subscriptions_of(class.id) {
            if let Some(ids) = self.providers.get(&(sub.key.clone(), sub.value(attrs))) {
                result.extend(ids.iter().copied());
            }
        }
        result
    }

    /// Records subscribing to what `class` instances with `attrs` provide
    pub fn what_subscribes(
        &self,
        registry: &ClassRegistry,
        class: &ResourceClass,
        attrs: &AttrMap,
    ) -> BTreeSet<RecordId> {
        let mut result = BTreeSet::new();
        for sub in registry.all_subscriptions() {
            if !class.is_a(&sub.subscribe_to) {
                continue;
            }
            if let Some(ids) = self.subscribers.get(&(sub.key.clone(), sub.value(attrs))) {
                result.extend(ids.iter().copied());
            }
        }
        result
    }

    pub fn add_resource(
        &mut self,
        registry: &ClassRegistry,
        record: RecordId,
        class: &ResourceClass,
        attrs: &AttrMap,
    ) {
        for sub in registry.all_subscriptions() {
            if class.is_a(&sub.subscribe_to) {
                self.providers
                    .entry((sub.key.clone(), sub.value(attrs)))
                    .or_default()
                    .insert(record);
            }
        }
        for sub in registry.subscriptions_of(class.id) {
            self.subscribers
                .entry((sub.key.clone(), sub.value(attrs)))
                .or_default()
                .insert(record);
        }
    }

    pub fn remove_resource(&mut self, record: RecordId) {
        for ids in self.providers.values_mut() {
            ids.remove(&record);
        }
        for ids in self.subscribers.values_mut() {
            ids.remove(&record);
        }
        self.providers.retain(|_, ids| !ids.is_empty());
        self.subscribers.retain(|_, ids| !ids.is_empty());
    }
}

// =============================================================================
// Manager State
// =============================================================================

/// All in-memory state guarded by the manager mutex
#[derive(Debug, Clone, Default)]
pub struct ManagerState {
    pub sessions: HashMap<RecordId, Session>,
    pub edges: EdgeIndex,
    pub class_index: HashMap<RecordId, ClassId>,
    pub subscribers: SubscriberIndex,
    pub active_alerts: HashMap<(RecordId, String), AlertId>,
    pub label_cache: HashMap<RecordId, String>,
    pub next_epoch: u64,
}
