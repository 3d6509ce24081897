//! Placement Client (C5): submits a group's DAG and sizes
//! to the external placement oracle and receives a task→node map.
//!
//! `PlacementClient` is a narrow trait over the oracle's wire contract so
//! the task manager can be tested against a deterministic double without
//! a real oracle process.

use crate::common::NodeId;
use crate::error::{FabricError, Result};
use crate::protocol::{codec::FrameCodec, Envelope, Message, PlacementAnswer, PlacementQuery};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;

#[async_trait]
pub trait PlacementClient: Send + Sync {
    async fn place(&self, query: PlacementQuery) -> Result<PlacementAnswer>;
}

/// Talks to the real oracle process over the internal wire protocol: one
/// `ask` per group, one `placement` reply. Fails with
/// `PlacementUnavailable` when the oracle socket errors or returns an
/// empty mapping.
pub struct OracleClient {
    addr: SocketAddr,
    codec: FrameCodec,
    connect_timeout: Duration,
    message_ids: AtomicU64,
}

impl OracleClient {
    pub fn new(addr: SocketAddr, max_frame_size: u32, connect_timeout: Duration) -> Self {
        Self {
            addr,
            codec: FrameCodec::new(max_frame_size),
            connect_timeout,
            message_ids: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl PlacementClient for OracleClient {
    async fn place(&self, query: PlacementQuery) -> Result<PlacementAnswer> {
        let expected: std::collections::HashSet<&str> =
            query.task_name_list.iter().map(String::as_str).collect();

        let attempt = async {
            let mut stream = TcpStream::connect(self.addr).await?;
            let message_id = self.message_ids.fetch_add(1, Ordering::Relaxed);
            self.codec
                .write_message(&mut stream, &Envelope::new(message_id, Message::Ask(query)))
                .await?;
            let reply = self.codec.read_message(&mut stream, None).await?;
            match reply.message {
                Message::Placement(answer) => Ok(answer),
                other => Err(FabricError::PlacementUnavailable(format!(
                    "oracle replied with {} instead of placement",
                    other.kind_name()
                ))),
            }
        };

        let answer = tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .map_err(|_| FabricError::PlacementUnavailable(self.addr.to_string()))??;

        if answer.assignments.is_empty() {
            return Err(FabricError::PlacementUnavailable(
                "oracle returned an empty mapping".to_string(),
            ));
        }
        let covered: std::collections::HashSet<&str> =
            answer.assignments.iter().map(|(t, _)| t.as_str()).collect();
        if covered != expected {
            return Err(FabricError::PlacementUnavailable(
                "oracle mapping does not cover every submitted task".to_string(),
            ));
        }
        Ok(answer)
    }
}

/// Deterministic round-robin placement used by tests and local demos: no
/// oracle process required.
pub struct StubPlacementClient {
    nodes: Vec<NodeId>,
}

impl StubPlacementClient {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl PlacementClient for StubPlacementClient {
    async fn place(&self, query: PlacementQuery) -> Result<PlacementAnswer> {
        if self.nodes.is_empty() {
            return Err(FabricError::PlacementUnavailable(
                "no nodes available for stub placement".to_string(),
            ));
        }
        let assignments = query
            .task_name_list
            .into_iter()
            .enumerate()
            .map(|(i, task)| (task, self.nodes[i % self.nodes.len()].clone()))
            .collect();
        Ok(PlacementAnswer { assignments })
    }
}

/// A placement client that always fails, for exercising the placement
/// outage path: the oracle is unreachable and every job submission must
/// still terminate cleanly.
pub struct UnavailablePlacementClient;

#[async_trait]
impl PlacementClient for UnavailablePlacementClient {
    async fn place(&self, _query: PlacementQuery) -> Result<PlacementAnswer> {
        Err(FabricError::PlacementUnavailable(
            "oracle is down".to_string(),
        ))
    }
}
