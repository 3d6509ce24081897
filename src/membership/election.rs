//! Coordinator election rule: the node with the largest
//! free compute memory among known members, ties broken by identity
//! string descending. Every node can run this comparison locally on its
//! own view, so no separate election protocol is needed — split-brain
//! re-merge uses the same rule.
//!
//! "Largest free compute memory" and "largest CPU memory" are treated as
//! the same field: `compute_free`.

use crate::common::NodeId;
use crate::membership::view::ClusterView;

/// Computes which member should be coordinator given the current view.
/// Returns `None` only if the view has no members at all.
pub fn elect(view: &ClusterView) -> Option<NodeId> {
    view.snapshot()
        .into_iter()
        .max_by(|a, b| {
            a.compute_free
                .cmp(&b.compute_free)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        })
        .map(|d| d.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeDescriptor;

    fn descriptor(id: &str, compute_free: u64) -> NodeDescriptor {
        let mut d = NodeDescriptor::new(NodeId::from_string(id), 1024, 10, 100);
        d.compute_free = compute_free;
        d
    }

    #[test]
    fn picks_largest_free_compute_memory() {
        let view = ClusterView::new();
        view.upsert(descriptor("a:1", 100));
        view.upsert(descriptor("b:1", 300));
        view.upsert(descriptor("c:1", 200));
        assert_eq!(elect(&view), Some(NodeId::from_string("b:1")));
    }

    #[test]
    fn ties_break_by_descending_identity_string() {
        let view = ClusterView::new();
        view.upsert(descriptor("aaa:1", 100));
        view.upsert(descriptor("zzz:1", 100));
        assert_eq!(elect(&view), Some(NodeId::from_string("zzz:1")));
    }

    #[test]
    fn empty_view_has_no_coordinator() {
        let view = ClusterView::new();
        assert_eq!(elect(&view), None);
    }
}
