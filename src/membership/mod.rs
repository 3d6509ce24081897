//! Membership and election (C3): peer discovery, coordinator election,
//! and liveness bookkeeping shared by every node in the fabric.

pub mod discovery;
pub mod election;
pub mod view;

pub use view::ClusterView;

use crate::common::NodeId;
use crate::config::Config;
use crate::pool::ConnectionPool;
use crate::protocol::{codec::FrameCodec, Envelope, Message, NodeDescriptor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ties the cluster view to the machinery that keeps it converged: running
/// the election rule after every membership change and broadcasting
/// `selected_center_node` when the local coordinator pointer moves.
pub struct Membership {
    pub self_id: NodeId,
    pub view: Arc<ClusterView>,
    pool: Arc<ConnectionPool>,
    codec: FrameCodec,
    config: Arc<Config>,
    next_message_id: AtomicU64,
}

impl Membership {
    pub fn new(self_id: NodeId, pool: Arc<ConnectionPool>, config: Arc<Config>) -> Self {
        Self {
            self_id,
            view: Arc::new(ClusterView::new()),
            pool,
            codec: FrameCodec::new(config.max_frame_size),
            config,
            next_message_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Startup discovery: sweep the subnet, and if any responder already
    /// knows a coordinator, adopt that coordinator's full view instead of
    /// relying on the sweep's partial results.
    pub async fn bootstrap(&self, self_descriptor: NodeDescriptor) {
        self.view.upsert(self_descriptor.clone());

        let base = match self.self_id.socket_addr() {
            Ok(std::net::SocketAddr::V4(v4)) => *v4.ip(),
            _ => return,
        };
        let targets = discovery::subnet_sweep_targets(base, self.config.port);
        let responders =
            discovery::sweep(&self.codec, &targets, self.config.discovery_probe_timeout).await;

        for responder in &responders {
            self.view.upsert(responder.clone());
        }

        // `get_node_info` answers with the responder's own descriptor, or
        // with the coordinator's descriptor if the responder already knows
        // one — so a sweep response may already be a
        // coordinator's descriptor under a different identity than the
        // address dialed. Run the election rule against what the sweep
        // found, then query whichever member it names directly for the
        // full view rather than trusting only the partial sweep.
        if let Some(candidate) = election::elect(&self.view) {
            if let Ok(addr) = candidate.socket_addr() {
                if let Some(members) = discovery::fetch_coordinator_view(
                    &self.codec,
                    addr,
                    self.config.discovery_probe_timeout,
                )
                .await
                {
                    for member in members {
                        self.view.upsert(member);
                    }
                }
            }
        }

        self.recompute_and_broadcast().await;
    }

    /// Runs the election rule against the current view; if the result
    /// differs from our locally held coordinator pointer, updates it and
    /// broadcasts `selected_center_node` to every known member.
    pub async fn recompute_and_broadcast(&self) {
        let Some(elected) = election::elect(&self.view) else {
            return;
        };
        if self.view.set_coordinator(elected.clone()) {
            info!(coordinator = %elected, "coordinator changed, broadcasting");
            if let Some(descriptor) = self.view.get(&elected) {
                self.broadcast_selected_center_node(&descriptor).await;
            }
        }
    }

    async fn broadcast_selected_center_node(&self, descriptor: &NodeDescriptor) {
        let members: Vec<NodeId> = self
            .view
            .snapshot()
            .into_iter()
            .map(|d| d.id)
            .filter(|id| id != &self.self_id)
            .collect();

        for member in members {
            let pool = self.pool.clone();
            let codec = self.codec;
            let descriptor = descriptor.clone();
            let message_id = self.next_id();
            tokio::spawn(async move {
                if let Err(e) =
                    send_one_way(&pool, &codec, &member, message_id, Message::SelectedCenterNode(descriptor)).await
                {
                    warn!(peer = %member, error = %e, "failed to broadcast selected_center_node");
                }
            });
        }
    }

    /// Applies an incoming `selected_center_node`. A repeat of the same
    /// descriptor is a no-op because `ClusterView::set_coordinator`
    /// already short-circuits on an unchanged pointer.
    pub fn handle_selected_center_node(&self, descriptor: NodeDescriptor) {
        self.view.upsert(descriptor.clone());
        if self.view.set_coordinator(descriptor.id.clone()) {
            info!(coordinator = %descriptor.id, "adopted coordinator from broadcast");
        }
    }

    /// Merges an incoming heartbeat (`single_node_info`) into the local
    /// view. Every node does this on receipt, not just the coordinator —
    /// the coordinator additionally runs the expiry sweep (see
    /// [`crate::coordinator`]).
    pub fn handle_heartbeat(&self, descriptor: NodeDescriptor) {
        let is_new = self.view.upsert(descriptor);
        if is_new {
            debug!("discovered new member via heartbeat");
        }
    }
}

async fn send_one_way(
    pool: &ConnectionPool,
    codec: &FrameCodec,
    peer: &NodeId,
    message_id: u64,
    message: Message,
) -> crate::error::Result<()> {
    let conn = pool.get_or_connect(peer).await?;
    let mut stream = conn.lock().await;
    codec
        .write_message(&mut *stream, &Envelope::new(message_id, message))
        .await
}
