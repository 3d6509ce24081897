//! The cluster view: a set of Node Descriptors keyed by
//! identity, plus a single `coordinator` pointer.
//!
//! Invariants: the coordinator is always a member of the set, at most one
//! coordinator exists per connected partition, and any node's view
//! converges to the coordinator's within one heartbeat interval of
//! hearing from it. Mutation is a single `parking_lot::RwLock`, held only
//! across observe-then-mutate sequences.

use crate::common::NodeId;
use crate::protocol::NodeDescriptor;
use parking_lot::RwLock;
use std::collections::HashMap;

pub struct ClusterView {
    members: RwLock<HashMap<NodeId, NodeDescriptor>>,
    coordinator: RwLock<Option<NodeId>>,
}

impl ClusterView {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            coordinator: RwLock::new(None),
        }
    }

    /// Inserts a new member or overwrites an existing one's mutable fields
    /// (and refreshes its heartbeat), per the `single_node_info` merge
    /// contract. Returns `true` if this is a newly seen member.
    pub fn upsert(&self, descriptor: NodeDescriptor) -> bool {
        let mut members = self.members.write();
        let is_new = !members.contains_key(&descriptor.id);
        members.insert(descriptor.id.clone(), descriptor);
        is_new
    }

    pub fn remove(&self, id: &NodeId) -> Option<NodeDescriptor> {
        self.members.write().remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeDescriptor> {
        self.members.read().get(id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.read().contains_key(id)
    }

    pub fn snapshot(&self) -> Vec<NodeDescriptor> {
        self.members.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn coordinator(&self) -> Option<NodeId> {
        self.coordinator.read().clone()
    }

    /// Sets the coordinator pointer. Returns `true` if this changed the
    /// pointer (used to decide whether a `selected_center_node` broadcast
    /// is needed) — re-applying the same descriptor is a no-op, per the
    /// idempotence property tested below.
    pub fn set_coordinator(&self, id: NodeId) -> bool {
        let mut coordinator = self.coordinator.write();
        if coordinator.as_ref() == Some(&id) {
            return false;
        }
        *coordinator = Some(id);
        true
    }

    pub fn is_coordinator(&self, id: &NodeId) -> bool {
        self.coordinator.read().as_ref() == Some(id)
    }

    /// Drops any member whose last heartbeat is older than `expiry`
    /// relative to `now`. Callers (the coordinator's expiry sweeper) are
    /// responsible for only invoking this while holding the coordinator
    /// role — non-coordinators do not expire peers.
    pub fn expire_stale(
        &self,
        now: std::time::SystemTime,
        expiry: std::time::Duration,
    ) -> Vec<NodeId> {
        let mut members = self.members.write();
        let stale: Vec<NodeId> = members
            .iter()
            .filter(|(_, d)| {
                now.duration_since(d.last_heartbeat())
                    .map(|age| age > expiry)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            members.remove(id);
        }
        stale
    }
}

impl Default for ClusterView {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeDescriptor;
    use std::time::Duration;

    fn descriptor(id: &str, compute_free: u64) -> NodeDescriptor {
        let mut d = NodeDescriptor::new(NodeId::from_string(id), 1024, 10, 100);
        d.compute_free = compute_free;
        d
    }

    #[test]
    fn upsert_reports_new_vs_existing() {
        let view = ClusterView::new();
        assert!(view.upsert(descriptor("a:1", 100)));
        assert!(!view.upsert(descriptor("a:1", 200)));
        assert_eq!(view.get(&NodeId::from_string("a:1")).unwrap().compute_free, 200);
    }

    #[test]
    fn setting_same_coordinator_twice_is_a_no_op() {
        let view = ClusterView::new();
        let id = NodeId::from_string("a:1");
        assert!(view.set_coordinator(id.clone()));
        assert!(!view.set_coordinator(id));
    }

    #[test]
    fn duplicate_heartbeat_does_not_change_cardinality() {
        let view = ClusterView::new();
        view.upsert(descriptor("a:1", 100));
        view.upsert(descriptor("a:1", 150));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn expiry_drops_only_stale_members() {
        let view = ClusterView::new();
        let mut fresh = descriptor("fresh:1", 100);
        fresh.touch_heartbeat();
        let mut stale = descriptor("stale:1", 100);
        stale.last_heartbeat_millis = 0;
        view.upsert(fresh);
        view.upsert(stale);

        let expired = view.expire_stale(std::time::SystemTime::now(), Duration::from_secs(20));
        assert_eq!(expired, vec![NodeId::from_string("stale:1")]);
        assert_eq!(view.len(), 1);
        assert!(view.contains(&NodeId::from_string("fresh:1")));
    }
}
