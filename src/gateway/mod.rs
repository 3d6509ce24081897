//! Front-end Gateway (C7): the cluster's single externally
//! facing control surface. One TCP listener, one session per connected
//! front-end, newline-terminated JSON in both directions.
//!
//! Only runs on the process currently holding the coordinator role, same
//! as [`crate::coordinator`], [`crate::placement`] and
//! [`crate::task_manager`].

pub mod types;

use crate::agent::NodeAgent;
use crate::common::NodeId;
use crate::coordinator::CoordinatorState;
use crate::protocol::{codec::FrameCodec, NodeInfoUpdate};
use crate::task_manager::TaskManager;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use types::{InboundMessage, OutboundMessage};

pub struct Gateway {
    agent: Arc<NodeAgent>,
    coordinator: Arc<CoordinatorState>,
    task_manager: Arc<TaskManager>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Gateway {
    pub fn new(
        agent: Arc<NodeAgent>,
        coordinator: Arc<CoordinatorState>,
        task_manager: Arc<TaskManager>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent,
            coordinator,
            task_manager,
            shutdown_rx,
        })
    }

    /// One accept loop for the whole gateway listener.
    pub async fn run_accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let gateway = self.clone();
                            tokio::spawn(async move {
                                gateway.run_session(stream).await;
                                debug!(peer = %peer, "front-end session ended");
                            });
                        }
                        Err(e) => warn!(error = %e, "gateway accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("gateway accept loop stopping for shutdown");
                        return;
                    }
                }
            }
        }
    }

    async fn run_session(self: Arc<Self>, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let Ok(mut line) = serde_json::to_vec(&message) else {
                    continue;
                };
                line.push(b'\n');
                if write_half.write_all(&line).await.is_err() {
                    return;
                }
            }
        });

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let bridge_tx = outbound_tx.clone();
        let bridge = tokio::spawn(async move {
            while let Some(event) = progress_rx.recv().await {
                if bridge_tx.send(OutboundMessage::from(event)).is_err() {
                    return;
                }
            }
        });

        let mut shutdown = self.shutdown_rx.clone();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    match serde_json::from_str::<InboundMessage>(&line) {
                        Ok(message) => {
                            self.handle_message(message, &progress_tx, &outbound_tx).await
                        }
                        Err(e) => {
                            warn!(error = %e, "rejecting malformed front-end envelope");
                            break;
                        }
                    }
                }
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "front-end session read failed");
                    break;
                }
            }
        }

        drop(outbound_tx);
        let _ = writer.await;
        bridge.abort();
    }

    async fn handle_message(
        &self,
        message: InboundMessage,
        progress_tx: &mpsc::UnboundedSender<crate::task_manager::progress::ProgressEvent>,
        outbound_tx: &mpsc::UnboundedSender<OutboundMessage>,
    ) {
        match message {
            InboundMessage::CreateTasks { media, job_id } => {
                info!(job = %job_id, "create_tasks received");
                self.task_manager
                    .submit_job(job_id, media, progress_tx.clone());
            }
            InboundMessage::StartAll => {
                let _ = outbound_tx.send(OutboundMessage::StartSuccess);
            }
            InboundMessage::NodeInfo => {
                let _ = outbound_tx.send(OutboundMessage::ClusterInfo {
                    members: self.coordinator.snapshot(),
                });
            }
            InboundMessage::Shutdown => {
                info!("shutdown received from front-end");
                self.agent.shutdown();
            }
            InboundMessage::GetFlying { opcode, .. } => {
                debug!(opcode = %opcode, "forwarded to flight collaborator (out of scope)");
            }
            InboundMessage::UpdateNodeInfo {
                cpu_memory,
                bandwidth,
                memory,
            } => {
                self.agent.apply_node_info_update(NodeInfoUpdate {
                    cpu_memory,
                    bandwidth,
                    memory,
                });
            }
            InboundMessage::AddNewNode { node_id } => {
                self.add_new_node(node_id, outbound_tx).await;
            }
        }
    }

    /// Probes `node_id` with `get_node_info` and folds the response into
    /// the cluster view, the same contract the startup discovery sweep
    /// uses against each responder. On success, answers
    /// the front-end with `ans_node_info` for the newly added node.
    async fn add_new_node(&self, node_id: String, outbound_tx: &mpsc::UnboundedSender<OutboundMessage>) {
        let peer = NodeId::from_string(node_id);
        let Ok(addr) = peer.socket_addr() else {
            warn!(peer = %peer, "add_new_node given an unparsable address");
            return;
        };
        let codec = FrameCodec::new(self.agent.config.max_frame_size);
        let descriptor = crate::membership::discovery::probe(
            &codec,
            addr,
            self.agent.config.discovery_probe_timeout,
        )
        .await;
        match descriptor {
            Some(descriptor) => {
                let _ = outbound_tx.send(OutboundMessage::AnsNodeInfo {
                    node: descriptor.clone(),
                });
                info!(peer = %peer, "added node via add_new_node");
                self.agent.membership.view.upsert(descriptor);
                self.agent.membership.recompute_and_broadcast().await;
            }
            None => warn!(peer = %peer, "add_new_node probe failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeId;
    use crate::config::Config;
    use crate::membership::Membership;
    use crate::placement::StubPlacementClient;
    use crate::pool::ConnectionPool;
    use crate::sink::RecordingSinkClient;
    use crate::task_manager::dag::StubFrameSplitter;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt as _, BufReader as TestBufReader};
    use tokio::net::TcpListener;

    async fn spawn_gateway() -> std::net::SocketAddr {
        let config = Arc::new(Config::default());
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(1)));
        let self_id = NodeId::from_string("127.0.0.1:0");
        let membership = Arc::new(Membership::new(self_id.clone(), pool.clone(), config.clone()));
        let agent = NodeAgent::new(
            self_id.clone(),
            config.clone(),
            membership.clone(),
            pool.clone(),
            Arc::new(crate::agent::inference::StubInferenceRunner),
        );
        membership
            .view
            .upsert(agent.descriptor_snapshot());
        membership.view.set_coordinator(self_id.clone());

        let coordinator = Arc::new(CoordinatorState::new(membership.view.clone(), config.clone()));
        let placement = Arc::new(StubPlacementClient::new(vec![self_id.clone()]));
        let splitter = Arc::new(StubFrameSplitter {
            total_frames: 1,
            frame_size_bytes: 1,
        });
        let sink = Arc::new(RecordingSinkClient::default());
        let task_manager = TaskManager::new(
            self_id,
            config,
            pool,
            placement,
            splitter,
            sink,
            agent.shutdown_watch(),
        );

        let gateway = Gateway::new(agent.clone(), coordinator, task_manager, agent.shutdown_watch());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(gateway.run_accept_loop(listener));
        addr
    }

    #[tokio::test]
    async fn node_info_replies_with_cluster_info() {
        let addr = spawn_gateway().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(b"{\"type\":\"node_info\"}\n")
            .await
            .unwrap();

        let mut lines = TestBufReader::new(read_half).lines();
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["type"], "cluster_info");
        assert_eq!(parsed["content"]["members"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_envelope_closes_the_connection() {
        let addr = spawn_gateway().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"not json at all\n").await.unwrap();
        drop(write_half);

        let mut lines = TestBufReader::new(read_half).lines();
        let result = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }
}
