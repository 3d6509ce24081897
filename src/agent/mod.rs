//! Node Agent (C2): lives on every node. Publishes its own
//! descriptor, admission-controls and runs inference requests, forwards
//! flight-control opcodes to their (out-of-scope) collaborator, and keeps
//! a heartbeat to whichever node membership currently names as
//! coordinator.

pub mod admission;
pub mod heartbeat;
pub mod inference;

use crate::common::{Coordinates, NodeId};
use crate::config::Config;
use crate::error::{FabricError, Result};
use crate::membership::Membership;
use crate::pool::ConnectionPool;
use crate::protocol::{
    codec::FrameCodec, Envelope, FrameBatch, InferenceResult, Message,
    NodeDescriptor, NodeInfoUpdate, SubTaskRef,
};
use admission::MemoryAccount;
use inference::InferenceRunner;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Telemetry fields `get_objects_new`/admission does not touch directly:
/// identity, bandwidth, storage, physical hints. Kept separate from
/// [`MemoryAccount`] so admission's hot path locks only what it needs.
struct StaticTelemetry {
    processing_speed: f64,
    storage_total: u64,
    storage_used: u64,
    bandwidth_capacity: u64,
    bandwidth_free: u64,
    cpu_used_rate: f64,
    coordinates: Coordinates,
    sense_radius: f64,
    neighbors: Vec<NodeId>,
}

pub struct NodeAgent {
    pub self_id: NodeId,
    pub config: Arc<Config>,
    pub membership: Arc<Membership>,
    pub pool: Arc<ConnectionPool>,
    memory: MemoryAccount,
    static_telemetry: Mutex<StaticTelemetry>,
    waiting: AtomicU32,
    dealt: AtomicU64,
    inference: Arc<dyn InferenceRunner>,
    codec: FrameCodec,
    message_ids: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl NodeAgent {
    pub fn new(
        self_id: NodeId,
        config: Arc<Config>,
        membership: Arc<Membership>,
        pool: Arc<ConnectionPool>,
        inference: Arc<dyn InferenceRunner>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            memory: MemoryAccount::new(config.cpu_memory, config.admission_parallelism as u32),
            static_telemetry: Mutex::new(StaticTelemetry {
                processing_speed: 1.0,
                storage_total: config.memory,
                storage_used: 0,
                bandwidth_capacity: config.bandwidth,
                bandwidth_free: config.bandwidth,
                cpu_used_rate: 0.0,
                coordinates: Coordinates { x: 0.0, y: 0.0 },
                sense_radius: 0.0,
                neighbors: Vec::new(),
            }),
            waiting: AtomicU32::new(0),
            dealt: AtomicU64::new(0),
            codec: FrameCodec::new(config.max_frame_size),
            message_ids: Arc::new(AtomicU64::new(1)),
            self_id,
            config,
            membership,
            pool,
            inference,
            shutdown_tx,
            shutdown_rx,
        })
    }

    fn next_message_id(&self) -> u64 {
        self.message_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// A fresh snapshot of this node's descriptor, combining live
    /// admission accounting with the static telemetry fields. Sent on
    /// every heartbeat and in reply to `get_node_info`.
    pub fn descriptor_snapshot(&self) -> NodeDescriptor {
        let t = self.static_telemetry.lock();
        let cap = self.memory.cap();
        let used = self.memory.used();
        NodeDescriptor {
            id: self.self_id.clone(),
            processing_speed: t.processing_speed,
            compute_total: cap,
            compute_used: used,
            compute_free: cap.saturating_sub(used),
            storage_total: t.storage_total,
            storage_used: t.storage_used,
            storage_free: t.storage_total.saturating_sub(t.storage_used),
            bandwidth_capacity: t.bandwidth_capacity,
            bandwidth_free: t.bandwidth_free,
            cpu_used_rate: t.cpu_used_rate,
            waiting: self.waiting.load(Ordering::Relaxed),
            dealing: self.memory.dealing(),
            dealt: self.dealt.load(Ordering::Relaxed),
            last_heartbeat_millis: now_millis(),
            coordinates: t.coordinates,
            sense_radius: t.sense_radius,
            neighbors: t.neighbors.clone(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// `shutdown`: stop accepting new connections,
    /// close every pooled socket, signal every other loop (heartbeat,
    /// dispatch workers) to finish and exit. Always succeeds.
    pub fn shutdown(&self) {
        info!(node = %self.self_id, "shutdown requested");
        let _ = self.shutdown_tx.send(true);
        self.pool.close_all();
    }

    /// Accept loop. Spawns one connection handler per accepted socket and
    /// stops taking new connections once `shutdown` fires.
    pub async fn run_accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let agent = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = agent.handle_connection(stream).await {
                                    debug!(peer = %peer, error = %e, "connection closed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("accept loop stopping for shutdown");
                        return;
                    }
                }
            }
        }
    }

    /// One connection handler. Reads envelopes in a loop until the peer closes
    /// or a framing error occurs; framing errors close the connection and
    /// log, they never crash the process.
    ///
    /// The read deadline applies only until this socket has carried a
    /// `get_objects_new`: once it's serving as a dispatch worker's work
    /// connection, reads are unbounded so a slow archival hand-off downstream
    /// doesn't make the agent tear down a socket mid-dispatch.
    async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
        self: &Arc<Self>,
        mut stream: S,
    ) -> Result<()> {
        let mut is_work_socket = false;
        loop {
            let deadline = if is_work_socket {
                None
            } else {
                Some(self.config.heartbeat_read_deadline)
            };
            let envelope = self.codec.read_message(&mut stream, deadline).await?;
            if matches!(envelope.message, Message::GetObjectsNew { .. }) {
                is_work_socket = true;
            }
            match self.dispatch(envelope.message, envelope.reply_hint).await {
                Ok(Some(reply)) => {
                    let message_id = self.next_message_id();
                    self.codec
                        .write_message(&mut stream, &Envelope::new(message_id, reply))
                        .await?;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "message handling failed, closing connection");
                    return Err(e);
                }
            }
        }
    }

    /// Dispatches one decoded message to its handler. Returns `Some` when
    /// the reply belongs on the same socket; `None` when the handler
    /// already delivered its answer elsewhere (e.g. `get_objects_new`
    /// with a `reply_hint`) or the message kind has no reply at all.
    async fn dispatch(
        self: &Arc<Self>,
        message: Message,
        reply_hint: Option<NodeId>,
    ) -> Result<Option<Message>> {
        match message {
            Message::GetNodeInfo => Ok(Some(self.handle_get_node_info())),
            Message::GetNodesInfo => Ok(Some(Message::AnsNodesInfo(
                self.membership.view.snapshot(),
            ))),
            Message::SingleNodeInfo(descriptor) => {
                self.membership.handle_heartbeat(descriptor);
                Ok(None)
            }
            Message::GetObjectsNew { sub_task, frames } => {
                self.handle_get_objects_new(sub_task, frames, reply_hint)
                    .await
            }
            Message::SelectedCenterNode(descriptor) => {
                self.membership.handle_selected_center_node(descriptor);
                Ok(None)
            }
            Message::UpdateNodeInfo(update) => {
                self.apply_update(update);
                Ok(None)
            }
            Message::Shutdown => {
                self.shutdown();
                Ok(None)
            }
            Message::GetFlying(opcode) | Message::MoveMachine(opcode) => {
                debug!(opcode = %opcode.opcode, "forwarded to flight collaborator (out of scope)");
                Ok(None)
            }
            other => Err(FabricError::BadEnvelope(format!(
                "node agent does not handle {} as an inbound request",
                other.kind_name()
            ))),
        }
    }

    /// `get_node_info` replies with this node's descriptor, or with the
    /// known coordinator's descriptor if one is known.
    fn handle_get_node_info(&self) -> Message {
        if let Some(coordinator) = self.membership.view.coordinator() {
            if let Some(descriptor) = self.membership.view.get(&coordinator) {
                return Message::AnsNodeInfo(descriptor);
            }
        }
        Message::AnsNodeInfo(self.descriptor_snapshot())
    }

    /// Applies a resource update received from the front-end gateway's
    /// `update_node_info`, same contract as the
    /// internal `update_node_info` message.
    pub fn apply_node_info_update(&self, update: NodeInfoUpdate) {
        self.apply_update(update)
    }

    fn apply_update(&self, update: NodeInfoUpdate) {
        if let Some(bandwidth) = update.bandwidth {
            let mut t = self.static_telemetry.lock();
            let used = t.bandwidth_capacity.saturating_sub(t.bandwidth_free);
            t.bandwidth_capacity = bandwidth;
            t.bandwidth_free = bandwidth.saturating_sub(used);
        }
        if let Some(memory) = update.memory {
            let mut t = self.static_telemetry.lock();
            t.storage_total = memory;
        }
        if let Some(cpu_memory) = update.cpu_memory {
            self.memory.update_cap(cpu_memory);
        }
    }

    /// Admission-controlled inference: request, wait for room, run,
    /// release.
    async fn handle_get_objects_new(
        self: &Arc<Self>,
        sub_task: SubTaskRef,
        frames: FrameBatch,
        reply_hint: Option<NodeId>,
    ) -> Result<Option<Message>> {
        let size = frames.size_bytes();

        self.waiting.fetch_add(1, Ordering::Relaxed);
        self.memory.admit(size).await;
        self.waiting.fetch_sub(1, Ordering::Relaxed);

        let outcome = self.inference.infer(&frames).await;

        match outcome {
            Ok(result) => {
                self.memory.release(size);
                self.dealt.fetch_add(1, Ordering::Relaxed);
                self.deliver_result(sub_task, result, reply_hint).await
            }
            Err(e) => {
                self.memory.release(size);
                error!(sub_task = %sub_task.sub_task_id, error = %e, "inference failed");
                Err(e)
            }
        }
    }

    async fn deliver_result(
        self: &Arc<Self>,
        sub_task: SubTaskRef,
        result: InferenceResult,
        reply_hint: Option<NodeId>,
    ) -> Result<Option<Message>> {
        let reply = Message::AnsGetObjects { sub_task, result };
        match reply_hint {
            None => Ok(Some(reply)),
            Some(hint) => {
                let pool = self.pool.clone();
                let codec = self.codec;
                let message_id = self.next_message_id();
                let conn = pool.get_or_connect(&hint).await?;
                let mut stream = conn.lock().await;
                codec
                    .write_message(&mut *stream, &Envelope::new(message_id, reply))
                    .await?;
                Ok(None)
            }
        }
    }

    /// Spawns the heartbeat loop (one per node).
    pub fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let membership = self.membership.clone();
        let pool = self.pool.clone();
        let config = self.config.clone();
        let message_ids = self.message_ids.clone();
        let shutdown = self.shutdown_rx.clone();
        let agent = self.clone();
        tokio::spawn(async move {
            heartbeat::run(
                membership,
                pool,
                config,
                message_ids,
                move || agent.descriptor_snapshot(),
                shutdown,
            )
            .await;
        })
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Connects to `peer` and sends `get_objects_new`, used by the task
/// manager's dispatch workers (C6) rather than by the agent itself — kept
/// here because it is the mirror image of [`NodeAgent::handle_connection`]
/// and shares the same wire contract.
pub async fn send_get_objects_new(
    pool: &ConnectionPool,
    codec: &FrameCodec,
    destination: &NodeId,
    message_id: u64,
    sub_task: SubTaskRef,
    frames: FrameBatch,
    reply_hint: Option<NodeId>,
) -> Result<()> {
    let conn = pool.get_or_connect(destination).await?;
    let mut stream = conn.lock().await;
    let mut message = Envelope::new(message_id, Message::GetObjectsNew { sub_task, frames });
    if let Some(hint) = reply_hint {
        message = message.with_reply_hint(hint);
    }
    codec.write_message(&mut *stream, &message).await
}
