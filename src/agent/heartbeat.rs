//! Heartbeat sender: every 2s, refresh local telemetry
//! and send `single_node_info` to the coordinator. If the underlying
//! connection is dead, mark the coordinator gone, trigger re-election,
//! and reopen a connection to whichever node the election rule now
//! names.

use crate::common::NodeId;
use crate::config::Config;
use crate::membership::Membership;
use crate::pool::ConnectionPool;
use crate::protocol::{codec::FrameCodec, Envelope, Message, NodeDescriptor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Runs the heartbeat loop until `shutdown` fires. `descriptor_fn` is
/// called on every tick to produce a freshly stamped [`NodeDescriptor`] —
/// the caller owns the authoritative telemetry (admission accounting,
/// dealt counters) and this loop only ships a snapshot of it.
pub async fn run(
    membership: Arc<Membership>,
    pool: Arc<ConnectionPool>,
    config: Arc<Config>,
    message_ids: Arc<AtomicU64>,
    mut descriptor_fn: impl FnMut() -> NodeDescriptor,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(config.heartbeat_interval);
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

        let Some(coordinator) = membership.view.coordinator() else {
            continue;
        };
        // Heartbeating to ourselves is pointless — we already hold the
        // authoritative copy of our own descriptor.
        if coordinator == membership.self_id {
            continue;
        }

        let descriptor = descriptor_fn();
        let message_id = message_ids.fetch_add(1, Ordering::Relaxed);
        let sent = send_heartbeat(&pool, &config, &coordinator, message_id, descriptor).await;

        if sent.is_err() {
            warn!(coordinator = %coordinator, "heartbeat send failed, coordinator presumed gone");
            pool.evict(&coordinator);
            membership.recompute_and_broadcast().await;
        } else {
            debug!(coordinator = %coordinator, "heartbeat sent");
        }
    }
}

async fn send_heartbeat(
    pool: &ConnectionPool,
    config: &Config,
    coordinator: &NodeId,
    message_id: u64,
    descriptor: NodeDescriptor,
) -> crate::error::Result<()> {
    let codec = FrameCodec::new(config.max_frame_size);
    let conn = pool.get_or_connect(coordinator).await?;
    let mut stream = conn.lock().await;
    codec
        .write_message(
            &mut *stream,
            &Envelope::new(message_id, Message::SingleNodeInfo(descriptor)),
        )
        .await
}
