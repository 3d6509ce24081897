//! Coordinator State (C4): the authoritative live view of
//! every node, answering cluster-info queries and expiring stale members.
//!
//! This is deliberately thin — [`crate::membership::ClusterView`] already
//! holds the merge semantics (`single_node_info` insert-or-overwrite) and
//! the snapshot used for `ans_nodes_info`. On coordinator
//! transition, any prior coordinator's descriptor is retained as an
//! ordinary member and subject to normal expiry — true for free, since
//! demotion only changes the `coordinator` pointer, never removes the
//! member. `CoordinatorState` adds the one piece of behavior that is
//! coordinator-only: the expiry sweeper.

use crate::common::NodeId;
use crate::config::Config;
use crate::membership::ClusterView;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::info;

pub struct CoordinatorState {
    view: Arc<ClusterView>,
    config: Arc<Config>,
}

impl CoordinatorState {
    pub fn new(view: Arc<ClusterView>, config: Arc<Config>) -> Self {
        Self { view, config }
    }

    /// One expiry sweeper, running only while this process
    /// holds the coordinator role. Stops as soon as `is_coordinator`
    /// reports otherwise, or `shutdown` fires — the caller is expected to
    /// spawn a fresh sweeper if this process is later re-elected.
    pub async fn run_expiry_sweeper(self: Arc<Self>, self_id: NodeId, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.expiry_sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            if self.view.coordinator().as_ref() != Some(&self_id) {
                // Lost the coordinator role since the last tick; this
                // sweeper's work belongs to whoever holds it now.
                return;
            }

            let expired = self.view.expire_stale(SystemTime::now(), self.config.expiry_threshold);
            for id in expired {
                info!(node = %id, "expired from cluster view: no heartbeat within threshold");
            }
        }
    }

    pub fn snapshot(&self) -> Vec<crate::protocol::NodeDescriptor> {
        self.view.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeDescriptor;
    use std::time::Duration;

    #[tokio::test]
    async fn sweeper_expires_stale_members_while_coordinator() {
        let view = Arc::new(ClusterView::new());
        let self_id = NodeId::from_string("a:1");
        view.upsert(NodeDescriptor::new(self_id.clone(), 4096, 10, 100));
        view.set_coordinator(self_id.clone());

        let mut stale = NodeDescriptor::new(NodeId::from_string("b:1"), 1024, 10, 100);
        stale.last_heartbeat_millis = 0;
        view.upsert(stale);

        let mut config = Config::default();
        config.expiry_threshold = Duration::from_millis(0);
        config.expiry_sweep_interval = Duration::from_millis(10);
        let config = Arc::new(config);

        let state = Arc::new(CoordinatorState::new(view.clone(), config));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(state.run_expiry_sweeper(self_id.clone(), rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(true);
        let _ = handle.await;

        assert_eq!(view.len(), 1);
        assert!(view.contains(&self_id));
    }

    #[tokio::test]
    async fn sweeper_stops_when_role_is_lost() {
        let view = Arc::new(ClusterView::new());
        let self_id = NodeId::from_string("a:1");
        view.upsert(NodeDescriptor::new(self_id.clone(), 4096, 10, 100));
        view.set_coordinator(NodeId::from_string("other:1"));

        let mut config = Config::default();
        config.expiry_sweep_interval = Duration::from_millis(10);
        let state = Arc::new(CoordinatorState::new(view, Arc::new(config)));
        let (_tx, rx) = watch::channel(false);

        tokio::time::timeout(Duration::from_millis(100), state.run_expiry_sweeper(self_id, rx))
            .await
            .expect("sweeper should return promptly once it is not the coordinator");
    }
}
